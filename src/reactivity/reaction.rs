// ============================================================================
// trellis - Reactions
// Eager, scheduled derivations with side effects, and the queue that
// drains them
// ============================================================================
//
// A reaction never produces a value and never has observers; it is a
// terminal of the graph. When its last stale input settles with a change
// it schedules itself; the queue drains when the outermost transaction
// closes, in FIFO order, until it stops refilling or trips the divergence
// guard.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::error::ReactiveError;
use crate::core::globals::with_globals;
use crate::core::types::{Derivation, DerivationBase, NodeId, anonymous_name};
use crate::introspection::spy::{SpyEvent, spy_report, spy_report_end, spy_report_start};
use crate::reactivity::batching::transaction;
use crate::reactivity::tracking::{
    clear_observing, panic_payload_message, track_derived_function,
};

/// Drain passes allowed before the runner declares divergence.
pub const MAX_REACTION_ITERATIONS: u32 = 100;

// =============================================================================
// REACTION CORE
// =============================================================================

type InvalidateFn = Box<dyn FnMut(&Reaction)>;

pub struct ReactionCore {
    id: NodeId,
    name: String,
    deriv_base: DerivationBase,

    /// Called on each scheduled run; typically re-enters `Reaction::track`.
    on_invalidate: RefCell<Option<InvalidateFn>>,

    is_scheduled: Cell<bool>,
    is_track_pending: Cell<bool>,
    is_running: Cell<bool>,
    is_disposed: Cell<bool>,

    self_weak: RefCell<Weak<ReactionCore>>,
}

impl ReactionCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queue this reaction and poke the runner. Idempotent while queued.
    fn schedule(&self) {
        if self.is_disposed.get() || self.is_scheduled.get() {
            return;
        }
        self.is_scheduled.set(true);
        log::trace!("{}: scheduled", self.name);
        spy_report(SpyEvent::ReactionScheduled {
            name: self.name.clone(),
        });
        with_globals(|g| g.add_pending_reaction(self.self_weak.borrow().clone()));
        run_reactions();
    }
}

impl Derivation for ReactionCore {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn derivation_base(&self) -> &DerivationBase {
        &self.deriv_base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn on_dependencies_ready(&self, any_changed: bool) -> bool {
        if any_changed {
            self.schedule();
        }
        // Reactions are terminals; nothing propagates past them.
        false
    }
}

// =============================================================================
// REACTION HANDLE
// =============================================================================

/// An effectful observer. Dropping the last handle disposes it; `dispose`
/// is the explicit, idempotent path.
///
/// # Example
/// ```
/// use trellis::{Reaction, observable};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let input = observable(1);
/// let seen = Rc::new(Cell::new(0));
///
/// let (input2, seen2) = (input.clone(), seen.clone());
/// let r = Reaction::new("copier", move |r| {
///     r.track(|| seen2.set(input2.get()));
/// });
/// r.schedule();
/// assert_eq!(seen.get(), 1);
///
/// input.set(7);
/// assert_eq!(seen.get(), 7);
/// ```
pub struct Reaction {
    core: Rc<ReactionCore>,
}

impl Reaction {
    /// Create a reaction. It does not run until scheduled or invalidated.
    pub fn new(name: impl Into<String>, on_invalidate: impl FnMut(&Reaction) + 'static) -> Self {
        Self::with_optional_name(Some(name.into()), Box::new(on_invalidate), "Reaction")
    }

    fn with_optional_name(name: Option<String>, on_invalidate: InvalidateFn, kind: &str) -> Self {
        let id = with_globals(|g| g.next_node_id());
        let name = name.unwrap_or_else(|| anonymous_name(kind, id));
        let core = Rc::new(ReactionCore {
            id,
            name,
            deriv_base: DerivationBase::new(),
            on_invalidate: RefCell::new(Some(on_invalidate)),
            is_scheduled: Cell::new(false),
            is_track_pending: Cell::new(false),
            is_running: Cell::new(false),
            is_disposed: Cell::new(false),
            self_weak: RefCell::new(Weak::new()),
        });
        *core.self_weak.borrow_mut() = Rc::downgrade(&core);
        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }

    /// Queue this reaction; it runs when no transaction is open.
    pub fn schedule(&self) {
        self.core.schedule();
    }

    pub fn is_scheduled(&self) -> bool {
        self.core.is_scheduled.get()
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed.get()
    }

    /// Run `f` as this reaction's tracked body: reads inside become the
    /// reaction's dependencies. Returns `None` if the reaction is disposed
    /// or the body panicked (the panic is logged and the partial dependency
    /// set kept, so the reaction retries on the next change).
    pub fn track<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let core = &self.core;
        if core.is_disposed.get() {
            return None;
        }
        transaction(|| {
            spy_report_start(SpyEvent::ReactionStart {
                name: core.name.clone(),
            });
            core.is_running.set(true);
            let derivation: Rc<dyn Derivation> = core.clone();
            let result = track_derived_function(&derivation, f);
            core.is_running.set(false);
            core.is_track_pending.set(false);
            if core.is_disposed.get() {
                // Disposed from inside its own body; the unsubscribe was
                // deferred until the run finished.
                clear_observing(&derivation);
            }
            let output = match result {
                Ok(value) => Some(value),
                Err(payload) => {
                    let message = panic_payload_message(&payload);
                    log::error!("{}: reaction failed: {message}", core.name);
                    spy_report(SpyEvent::Error {
                        name: core.name.clone(),
                        message,
                    });
                    None
                }
            };
            spy_report_end();
            output
        })
    }

    /// Permanently stop this reaction and unsubscribe it from everything.
    /// Safe to call at any time, including from inside the reaction's own
    /// body, and idempotent.
    pub fn dispose(&self) {
        let core = &self.core;
        if core.is_disposed.get() {
            return;
        }
        core.is_disposed.set(true);
        log::trace!("{}: disposed", core.name);
        if !core.is_running.get() {
            transaction(|| {
                clear_observing(&(core.clone() as Rc<dyn Derivation>));
            });
        }
    }

    /// Type-erased derivation view for graph operations and introspection.
    pub fn as_derivation(&self) -> Rc<dyn Derivation> {
        self.core.clone()
    }
}

impl Clone for Reaction {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl Drop for Reaction {
    fn drop(&mut self) {
        // Last handle gone: the reaction can never be disposed explicitly
        // anymore, so do it now.
        if Rc::strong_count(&self.core) == 1 && !self.core.is_disposed.get() {
            self.dispose();
        }
    }
}

impl std::fmt::Debug for Reaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaction")
            .field("name", &self.core.name)
            .field("scheduled", &self.core.is_scheduled.get())
            .field("disposed", &self.core.is_disposed.get())
            .finish()
    }
}

// =============================================================================
// AUTORUN
// =============================================================================

/// Run `view` once immediately, then again every time anything it read
/// changes. Returns the disposer handle.
pub fn autorun(view: impl FnMut() + 'static) -> Reaction {
    autorun_impl(None, view)
}

/// [`autorun`] with an explicit name for errors, spy events and trees.
pub fn autorun_named(name: impl Into<String>, view: impl FnMut() + 'static) -> Reaction {
    autorun_impl(Some(name.into()), view)
}

fn autorun_impl(name: Option<String>, view: impl FnMut() + 'static) -> Reaction {
    let view = Rc::new(RefCell::new(view));
    let reaction = Reaction::with_optional_name(
        name,
        Box::new(move |handle: &Reaction| {
            let view = view.clone();
            handle.track(|| (*view.borrow_mut())());
        }),
        "Autorun",
    );
    reaction.schedule();
    reaction
}

// =============================================================================
// REACTION RUNNER
// =============================================================================

/// Drain the pending-reaction queue. No-op while a transaction is open or
/// a drain is already in progress; writes performed by running reactions
/// refill the queue and extend the drain.
pub fn run_reactions() {
    let can_run = with_globals(|g| g.batch_depth() == 0 && !g.is_running_reactions());
    if !can_run {
        return;
    }
    with_globals(|g| {
        g.set_running_reactions(true);
    });

    struct RunnerGuard;
    impl Drop for RunnerGuard {
        fn drop(&mut self) {
            with_globals(|g| {
                g.set_running_reactions(false);
            });
        }
    }
    let _guard = RunnerGuard;

    let mut iterations: u32 = 0;
    loop {
        let pending = with_globals(|g| g.take_pending_reactions());
        if pending.is_empty() {
            break;
        }
        iterations += 1;
        if iterations > MAX_REACTION_ITERATIONS {
            let name = pending
                .iter()
                .find_map(Weak::upgrade)
                .map(|core| core.name.clone())
                .unwrap_or_else(|| "<disposed reaction>".to_string());
            let error = ReactiveError::ReactionDivergence {
                name,
                iterations: MAX_REACTION_ITERATIONS,
            };
            log::error!("{error}");
            panic!("{error}");
        }
        for weak in pending {
            if let Some(core) = weak.upgrade() {
                run_single_reaction(&core);
            }
        }
    }
}

fn run_single_reaction(core: &Rc<ReactionCore>) {
    if core.is_disposed.get() {
        return;
    }
    log::trace!("{}: running", core.name);
    transaction(|| {
        core.is_scheduled.set(false);
        core.is_track_pending.set(true);
        let callback = core.on_invalidate.borrow_mut().take();
        if let Some(mut callback) = callback {
            let handle = Reaction { core: core.clone() };
            callback(&handle);
            if !core.is_disposed.get() {
                *core.on_invalidate.borrow_mut() = Some(callback);
            }
        }
        core.is_track_pending.set(false);
    });
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::globals::reset_global_state;
    use crate::observables::value::observable;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn autorun_runs_immediately_and_on_change() {
        let input = observable(1);
        let log = Rc::new(RefCell::new(Vec::new()));

        let (input2, log2) = (input.clone(), log.clone());
        let _r = autorun(move || log2.borrow_mut().push(input2.get()));
        assert_eq!(*log.borrow(), vec![1]);

        input.set(4);
        assert_eq!(*log.borrow(), vec![1, 4]);

        // Writing the same value again wakes nobody.
        input.set(4);
        assert_eq!(*log.borrow(), vec![1, 4]);
    }

    #[test]
    fn disposal_stops_future_runs() {
        let input = observable(0);
        let log = Rc::new(RefCell::new(Vec::new()));

        let (input2, log2) = (input.clone(), log.clone());
        let r = autorun(move || log2.borrow_mut().push(input2.get()));
        input.set(1);
        assert_eq!(log.borrow().len(), 2);

        r.dispose();
        assert!(r.is_disposed());
        input.set(2);
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(input.observer_count(), 0);
    }

    #[test]
    fn dispose_is_idempotent() {
        let r = autorun(|| {});
        r.dispose();
        r.dispose();
        assert!(r.is_disposed());
    }

    #[test]
    fn dispose_from_inside_own_body() {
        let input = observable(0);
        let input2 = input.clone();
        let slot: Rc<RefCell<Option<Reaction>>> = Rc::new(RefCell::new(None));
        let slot2 = slot.clone();

        let r = autorun(move || {
            let value = input2.get();
            if value >= 1 {
                if let Some(me) = slot2.borrow().as_ref() {
                    me.dispose();
                }
            }
        });
        *slot.borrow_mut() = Some(r.clone());

        input.set(1);
        assert!(r.is_disposed());
        assert_eq!(input.observer_count(), 0);

        slot.borrow_mut().take();
    }

    #[test]
    fn dropping_the_last_handle_disposes() {
        let input = observable(0);
        {
            let input2 = input.clone();
            let _r = autorun(move || {
                let _ = input2.get();
            });
            assert_eq!(input.observer_count(), 1);
        }
        assert_eq!(input.observer_count(), 0);
    }

    #[test]
    fn reactions_fire_in_scheduling_order() {
        let input = observable(0);
        let log = Rc::new(RefCell::new(Vec::new()));

        let (i1, l1) = (input.clone(), log.clone());
        let _first = autorun(move || {
            let _ = i1.get();
            l1.borrow_mut().push("first");
        });
        let (i2, l2) = (input.clone(), log.clone());
        let _second = autorun(move || {
            let _ = i2.get();
            l2.borrow_mut().push("second");
        });

        log.borrow_mut().clear();
        input.set(1);
        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn failing_reaction_stays_subscribed() {
        let input = observable(0);
        let runs = Rc::new(RefCell::new(0));

        let (input2, runs2) = (input.clone(), runs.clone());
        let _r = autorun(move || {
            *runs2.borrow_mut() += 1;
            if input2.get() == 1 {
                panic!("bad state");
            }
        });
        assert_eq!(*runs.borrow(), 1);

        // The failing run is logged, not fatal.
        input.set(1);
        assert_eq!(*runs.borrow(), 2);

        // Still subscribed: the next change runs it again.
        input.set(2);
        assert_eq!(*runs.borrow(), 3);
    }

    #[test]
    fn self_rescheduling_reaction_converges() {
        let counter = observable(0);
        let counter2 = counter.clone();
        let _r = autorun(move || {
            let value = counter2.get();
            if value < 5 {
                counter2.set(value + 1);
            }
        });
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn unbounded_self_rescheduling_diverges() {
        let counter = observable(0u64);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let counter2 = counter.clone();
            let _r = autorun(move || {
                let value = counter2.get();
                counter2.set(value + 1);
            });
        }));
        assert!(result.is_err());
        reset_global_state();
    }

    #[test]
    fn scheduled_flag_visible_inside_transaction() {
        let input = observable(0);
        let input2 = input.clone();
        let r = autorun(move || {
            let _ = input2.get();
        });

        crate::reactivity::batching::transaction(|| {
            input.set(1);
            assert!(r.is_scheduled());
        });
        assert!(!r.is_scheduled());
    }

    #[test]
    fn reaction_without_track_never_binds() {
        let r = Reaction::new("inert", |_| {});
        r.schedule();
        assert_eq!(r.as_derivation().derivation_base().observing_len(), 0);
    }
}
