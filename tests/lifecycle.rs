//! Node lifecycles: handle drops, hot/cold computed transitions, hook
//! firing across the whole chain, and recovery after failures.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use trellis::{Atom, autorun, computed, observable, reset_global_state};

#[test]
fn computed_stays_alive_through_its_observers() {
    let x = observable(1);
    let seen = Rc::new(Cell::new(0));

    let reaction = {
        let x2 = x.clone();
        let doubled = computed(move || x2.get() * 2);
        let seen2 = seen.clone();
        let d2 = doubled.clone();
        autorun(move || seen2.set(d2.get()))
        // the `doubled` handle drops here; the reaction keeps the node
        // alive through its observing list
    };

    assert_eq!(seen.get(), 2);
    x.set(3);
    assert_eq!(seen.get(), 6);

    drop(reaction);
    assert_eq!(x.observer_count(), 0);
}

#[test]
fn unobserving_cascades_up_the_chain() {
    let observed = Rc::new(Cell::new(0u32));
    let unobserved = Rc::new(Cell::new(0u32));

    let (o2, u2) = (observed.clone(), unobserved.clone());
    let source = Atom::with_hooks(
        "source",
        Some(Box::new(move || o2.set(o2.get() + 1))),
        Some(Box::new(move || u2.set(u2.get() + 1))),
    );

    let s2 = source.clone();
    let tick = Rc::new(Cell::new(0));
    let t2 = tick.clone();
    let derived = computed(move || {
        s2.report_observed();
        t2.get()
    });

    let d2 = derived.clone();
    let r = autorun(move || {
        let _ = d2.get();
    });
    assert_eq!(observed.get(), 1);
    assert_eq!(unobserved.get(), 0);

    // Disposing the only observer suspends the computed, which lets go of
    // the atom.
    r.dispose();
    assert_eq!(unobserved.get(), 1);
    assert!(!derived.is_being_observed());
    assert!(!source.is_being_observed());
}

#[test]
fn cold_computed_drops_no_state() {
    let x = observable(5);
    let x2 = x.clone();
    let squared = computed(move || x2.get() * x2.get());

    // Hot phase.
    let s2 = squared.clone();
    let r = autorun(move || {
        let _ = s2.get();
    });
    assert_eq!(squared.get(), 25);
    r.dispose();

    // Cold phase: fresh values on every read, no subscriptions.
    x.set(6);
    assert_eq!(squared.get(), 36);
    assert_eq!(x.observer_count(), 0);

    // Heating up again works.
    let s3 = squared.clone();
    let _r2 = autorun(move || {
        let _ = s3.get();
    });
    assert_eq!(x.observer_count(), 1);
    x.set(7);
    assert_eq!(squared.get(), 49);
}

#[test]
fn several_handles_one_reaction() {
    let x = observable(0);
    let runs = Rc::new(Cell::new(0u32));

    let (x2, runs2) = (x.clone(), runs.clone());
    let r1 = autorun(move || {
        let _ = x2.get();
        runs2.set(runs2.get() + 1);
    });
    let r2 = r1.clone();

    // Dropping one handle does not dispose while another survives.
    drop(r1);
    x.set(1);
    assert_eq!(runs.get(), 2);

    drop(r2);
    x.set(2);
    assert_eq!(runs.get(), 2);
}

#[test]
fn runtime_survives_a_divergence_panic() {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let x = observable(0u32);
        let x2 = x.clone();
        let _r = autorun(move || {
            let value = x2.get();
            x2.set(value + 1);
        });
    }));
    assert!(result.is_err());
    reset_global_state();

    // A fresh graph on the same thread behaves normally.
    let x = observable(1);
    let log = Rc::new(Cell::new(0));
    let (x2, log2) = (x.clone(), log.clone());
    let _r = autorun(move || log2.set(x2.get()));
    x.set(42);
    assert_eq!(log.get(), 42);
}

#[test]
fn atoms_outlive_their_observers() {
    let a = Atom::new("durable");
    for _ in 0..3 {
        let a2 = a.clone();
        let r = autorun(move || a2.report_observed());
        assert_eq!(a.observer_count(), 1);
        drop(r);
        assert_eq!(a.observer_count(), 0);
    }
    a.report_changed();
}
