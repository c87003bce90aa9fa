// ============================================================================
// trellis - Dependency Tracking
// Collecting reads during a derivation run and rebinding the graph
// ============================================================================
//
// A tracked run swaps itself into the thread-local tracking slot, hands out
// a fresh run id, and lets every observable read during the run append
// itself to the derivation's observing list. Afterwards the new list is
// diffed against the previous one using each observable's scratch counter,
// so binding is O(|old| + |new|) with no per-run allocations beyond the
// list itself.
// ============================================================================

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::core::error::ReactiveError;
use crate::core::globals::with_globals;
use crate::core::types::{Derivation, Observable, ObservingList};
use crate::reactivity::propagation::{add_observer, remove_observer};

// =============================================================================
// READ REGISTRATION
// =============================================================================

/// Register a read of `observable` with the derivation currently tracking,
/// if any. Repeated reads within one run are collapsed via the run id.
pub fn report_observed(observable: &Rc<dyn Observable>) {
    with_globals(|g| {
        if let Some(derivation) = g.tracking() {
            let run_id = derivation.derivation_base().run_id();
            let obs_base = observable.observable_base();
            if obs_base.last_accessed_by() != run_id {
                obs_base.set_last_accessed_by(run_id);
                derivation
                    .derivation_base()
                    .push_observing(observable.clone());
            }
        }
    });
}

// =============================================================================
// TRACKED EXECUTION
// =============================================================================

/// Run `f` in the scope of `derivation`: every observable read inside
/// becomes a dependency. Returns the closure's value, or the raw panic
/// payload if it unwound.
///
/// The dependency diff is applied on both paths. A failed run keeps the
/// reads it managed to perform, so the derivation stays subscribed and can
/// retry when any of them changes; the tracking slot is restored either way.
pub(crate) fn track_derived_function<T>(
    derivation: &Rc<dyn Derivation>,
    f: impl FnOnce() -> T,
) -> Result<T, Box<dyn Any + Send>> {
    let base = derivation.derivation_base();
    let prev_observing = base.take_observing();
    base.set_run_id(with_globals(|g| g.next_run_id()));
    let prev_tracking = with_globals(|g| g.set_tracking(Some(Rc::downgrade(derivation))));

    let result = catch_unwind(AssertUnwindSafe(f));

    with_globals(|g| {
        g.set_tracking(prev_tracking);
    });
    bind_dependencies(derivation, prev_observing);

    result
}

/// Diff the freshly collected observing list against the previous run's,
/// in three passes over each observable's scratch mark. The raw list may
/// contain duplicates (nested tracking runs defeat the run-id check); the
/// first pass collapses them. Every mark is back at zero when this
/// returns, so no reset sweep is ever needed.
fn bind_dependencies(derivation: &Rc<dyn Derivation>, prev_observing: ObservingList) {
    let base = derivation.derivation_base();
    let raw_observing = base.take_observing();

    // First occurrence marks 1 and stays; extras drop out.
    let mut new_observing: ObservingList = SmallVec::with_capacity(raw_observing.len());
    for observable in raw_observing {
        let obs_base = observable.observable_base();
        if obs_base.diff_value() == 0 {
            obs_base.set_diff_value(1);
            new_observing.push(observable);
        }
    }

    // A previous dependency still at 0 was not read this run; shared ones
    // are reset to 0 here so the final pass can tell them apart.
    let mut dropped: Vec<Rc<dyn Observable>> = Vec::new();
    for observable in &prev_observing {
        let obs_base = observable.observable_base();
        if obs_base.diff_value() == 0 {
            dropped.push(observable.clone());
        }
        obs_base.set_diff_value(0);
    }

    // Whatever still carries 1 was not in the previous list.
    let mut fresh: Vec<Rc<dyn Observable>> = Vec::new();
    for observable in &new_observing {
        let obs_base = observable.observable_base();
        if obs_base.diff_value() == 1 {
            obs_base.set_diff_value(0);
            fresh.push(observable.clone());
        }
    }

    base.set_observing(new_observing);

    // Edge mutation happens after the marks are settled; observer hooks may
    // run arbitrary user code.
    for observable in &fresh {
        add_observer(observable, derivation);
    }
    for observable in &dropped {
        remove_observer(observable, derivation);
    }
}

/// Unsubscribe `derivation` from everything it observes.
pub(crate) fn clear_observing(derivation: &Rc<dyn Derivation>) {
    let dropped = derivation.derivation_base().take_observing();
    for observable in dropped.iter() {
        remove_observer(observable, derivation);
    }
}

// =============================================================================
// SCOPED SUPPRESSION
// =============================================================================

/// Run `f` with dependency collection suspended: reads inside do not bind
/// to the enclosing derivation. Restored on all exit paths.
///
/// # Example
/// ```
/// use trellis::{autorun, observable, untracked};
///
/// let a = observable(1);
/// let b = observable(2);
/// let a2 = a.clone();
/// let b2 = b.clone();
/// let _r = autorun(move || {
///     let _ = a2.get() + untracked(|| b2.get());
/// });
/// // writes to `b` will not re-run the autorun
/// ```
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    let prev = with_globals(|g| g.set_tracking(None));

    struct RestoreTracking(Option<Weak<dyn Derivation>>);
    impl Drop for RestoreTracking {
        fn drop(&mut self) {
            let prev = self.0.take();
            with_globals(|g| {
                g.set_tracking(prev);
            });
        }
    }

    let _guard = RestoreTracking(prev);
    f()
}

/// Run `f` with the mutation permission forced to `allow`. Restored on all
/// exit paths.
pub fn allow_state_changes<T>(allow: bool, f: impl FnOnce() -> T) -> T {
    let prev = with_globals(|g| g.set_allow_state_changes(allow));

    struct RestoreAllow(bool);
    impl Drop for RestoreAllow {
        fn drop(&mut self) {
            with_globals(|g| {
                g.set_allow_state_changes(self.0);
            });
        }
    }

    let _guard = RestoreAllow(prev);
    f()
}

/// Whether a write to an observable is currently legal.
pub(crate) fn state_changes_allowed() -> bool {
    with_globals(|g| g.computation_depth() == 0 && g.allow_state_changes())
}

pub(crate) fn check_state_changes_allowed(name: &str) -> Result<(), ReactiveError> {
    if state_changes_allowed() {
        Ok(())
    } else {
        Err(ReactiveError::StateMutationDisallowed {
            name: name.to_string(),
        })
    }
}

/// Render a panic payload for logs and memoized errors.
pub(crate) fn panic_payload_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

// =============================================================================
// TESTS
// =============================================================================
