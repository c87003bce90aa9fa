// ============================================================================
// trellis - Batching
// Transactions, actions, and the reaction-deferral gate
// ============================================================================
//
// Change notifications stay synchronous inside a transaction: the stale and
// ready waves still run through the computed graph. Only reaction side
// effects are deferred, to the moment the outermost transaction closes.
// ============================================================================

use std::rc::Weak;

use crate::core::globals::with_globals;
use crate::core::types::Derivation;
use crate::introspection::spy::{SpyEvent, spy_report_end, spy_report_start};
use crate::reactivity::reaction::run_reactions;

// =============================================================================
// BATCH EDGES
// =============================================================================

/// Open a transaction. Every `start_batch` must be paired with `end_batch`;
/// prefer [`transaction`] which guarantees the pairing.
pub fn start_batch() {
    with_globals(|g| {
        g.enter_batch();
    });
}

/// Close a transaction. When the outermost one closes, the pending
/// reactions drain.
pub fn end_batch() {
    let depth = with_globals(|g| g.exit_batch());
    if depth == 0 {
        run_reactions();
    }
}

// =============================================================================
// TRANSACTION
// =============================================================================

/// Run `f` inside a transaction: reaction side effects are deferred until
/// the outermost transaction returns. Closed on all exit paths.
///
/// # Example
/// ```
/// use trellis::{autorun, observable, transaction};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let a = observable(1);
/// let b = observable(2);
/// let runs = Rc::new(Cell::new(0));
///
/// let (a2, b2, runs2) = (a.clone(), b.clone(), runs.clone());
/// let _r = autorun(move || {
///     let _ = a2.get() + b2.get();
///     runs2.set(runs2.get() + 1);
/// });
/// assert_eq!(runs.get(), 1);
///
/// transaction(|| {
///     a.set(10);
///     b.set(20);
/// });
/// // one run for both writes
/// assert_eq!(runs.get(), 2);
/// ```
pub fn transaction<T>(f: impl FnOnce() -> T) -> T {
    start_batch();

    struct BatchGuard;
    impl Drop for BatchGuard {
        fn drop(&mut self) {
            end_batch();
        }
    }

    let _guard = BatchGuard;
    f()
}

// =============================================================================
// ACTIONS
// =============================================================================

/// Run `f` as a named action: a transaction that also grants mutation
/// permission, suspends dependency collection, and reports itself to the
/// spy channel. This is the intended write path under strict mode.
pub fn run_as_action<T>(name: &str, f: impl FnOnce() -> T) -> T {
    spy_report_start(SpyEvent::ActionStart {
        name: name.to_string(),
    });
    start_batch();
    let (prev_allow, prev_tracking) = with_globals(|g| {
        g.enter_action();
        (g.set_allow_state_changes(true), g.set_tracking(None))
    });

    struct ActionGuard {
        prev_allow: bool,
        prev_tracking: Option<Option<Weak<dyn Derivation>>>,
    }
    impl Drop for ActionGuard {
        fn drop(&mut self) {
            let prev_tracking = self.prev_tracking.take().unwrap_or(None);
            with_globals(|g| {
                g.set_tracking(prev_tracking);
                g.set_allow_state_changes(self.prev_allow);
                g.exit_action();
            });
            end_batch();
            spy_report_end();
        }
    }

    let _guard = ActionGuard {
        prev_allow,
        prev_tracking: Some(prev_tracking),
    };
    f()
}

/// Anonymous [`run_as_action`].
pub fn action<T>(f: impl FnOnce() -> T) -> T {
    let name = with_globals(|g| crate::core::types::anonymous_name("Action", g.next_node_id()));
    run_as_action(&name, f)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::globals::{in_action, is_batching, set_strict_mode};
    use crate::observables::computed::computed;
    use crate::observables::value::observable;
    use crate::reactivity::reaction::autorun;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn transaction_defers_reactions() {
        let a = observable(1);
        let b = observable(2);
        let runs = Rc::new(Cell::new(0));

        let (a2, b2, runs2) = (a.clone(), b.clone(), runs.clone());
        let _r = autorun(move || {
            let _ = a2.get() + b2.get();
            runs2.set(runs2.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        transaction(|| {
            a.set(10);
            assert_eq!(runs.get(), 1);
            b.set(20);
            assert_eq!(runs.get(), 1);
        });
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn nested_transactions_defer_to_the_outermost() {
        let a = observable(0);
        let runs = Rc::new(Cell::new(0));

        let (a2, runs2) = (a.clone(), runs.clone());
        let _r = autorun(move || {
            let _ = a2.get();
            runs2.set(runs2.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        transaction(|| {
            a.set(1);
            transaction(|| {
                a.set(2);
            });
            // Inner transaction closed, outer still open.
            assert_eq!(runs.get(), 1);
            a.set(3);
        });
        assert_eq!(runs.get(), 2);
        assert_eq!(a.get(), 3);
    }

    #[test]
    fn transaction_returns_the_value() {
        assert_eq!(transaction(|| 42), 42);
    }

    #[test]
    fn transaction_closes_on_panic() {
        let result = std::panic::catch_unwind(|| {
            transaction(|| panic!("inside"));
        });
        assert!(result.is_err());
        assert!(!is_batching());
    }

    #[test]
    fn computeds_stay_consistent_inside_a_transaction() {
        let a = observable(1);
        let a2 = a.clone();
        let double = computed(move || a2.get() * 2);

        let d2 = double.clone();
        let _r = autorun(move || {
            let _ = d2.get();
        });

        transaction(|| {
            a.set(10);
            // The computed graph has already settled mid-transaction.
            assert_eq!(double.get(), 20);
        });
    }

    #[test]
    fn action_grants_mutation_under_strict_mode() {
        let a = observable(0);
        set_strict_mode(true);

        assert!(a.try_set(1).is_err());
        let a2 = a.clone();
        run_as_action("write", move || {
            assert!(in_action());
            a2.set(1);
        });

        set_strict_mode(false);
        assert_eq!(a.get(), 1);
        assert!(!in_action());
    }

    #[test]
    fn action_suppresses_dependency_collection() {
        let a = observable(0);
        let b = observable(0);
        let runs = Rc::new(Cell::new(0));

        let (a2, b2, runs2) = (a.clone(), b.clone(), runs.clone());
        let _r = autorun(move || {
            let _ = a2.get();
            runs2.set(runs2.get() + 1);
            // Reads inside the action do not become dependencies.
            action(|| {
                let _ = b2.get();
            });
        });
        assert_eq!(runs.get(), 1);

        b.set(5);
        assert_eq!(runs.get(), 1);

        a.set(5);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn action_restores_state_on_panic() {
        let result = std::panic::catch_unwind(|| {
            run_as_action("explosive", || panic!("bang"));
        });
        assert!(result.is_err());
        assert!(!is_batching());
        assert!(!in_action());
    }
}
