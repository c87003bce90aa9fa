// ============================================================================
// trellis - Change Propagation
// Two-phase stale/ready wave through the observer graph
// ============================================================================
//
// A change broadcast first walks the observer graph marking everything
// downstream stale, then walks it again releasing the marks with a changed
// flag. A derivation revalidates only when its last stale input settles,
// so diamonds collapse into a single recomputation and no observer ever
// reads a half-updated graph.
// ============================================================================

use std::rc::Rc;

use crate::core::types::{Derivation, Observable};
use crate::reactivity::batching::{end_batch, start_batch};

// =============================================================================
// OBSERVER EDGES
// =============================================================================

/// Add `observer` to `observable`'s observer set, firing the
/// become-observed hook on the empty -> non-empty transition.
pub(crate) fn add_observer(observable: &Rc<dyn Observable>, observer: &Rc<dyn Derivation>) {
    let base = observable.observable_base();
    let was_unobserved = !base.has_observers();
    base.push_observer(Rc::downgrade(observer));
    if was_unobserved {
        observable.on_become_observed();
    }
}

/// Remove `observer` from `observable`'s observer set, firing the
/// become-unobserved hook when the set empties.
pub(crate) fn remove_observer(observable: &Rc<dyn Observable>, observer: &Rc<dyn Derivation>) {
    let base = observable.observable_base();
    if base.remove_observer(observer) && !base.has_observers() {
        observable.on_become_unobserved();
    }
}

// =============================================================================
// CHANGE BROADCAST
// =============================================================================

/// Broadcast a confirmed change of `observable`: stale wave, value commit,
/// ready wave, all inside a transaction so reactions fire at the edge.
///
/// Both waves use the same observer snapshot; observers that join mid-wave
/// have already read the committed value and need no notification.
pub(crate) fn broadcast_change(observable: &Rc<dyn Observable>, commit: impl FnOnce()) {
    let observers = observable.observable_base().collect_observers();
    log::trace!(
        "{}: change broadcast to {} observer(s)",
        observable.name(),
        observers.len()
    );
    start_batch();
    for observer in &observers {
        notify_dependency_stale(observer);
    }
    commit();
    for observer in &observers {
        notify_dependency_ready(observer, true);
    }
    end_batch();
}

/// Tell every observer of `observable` that one of its inputs went stale.
pub(crate) fn propagate_stale(observable: &Rc<dyn Observable>) {
    for observer in observable.observable_base().collect_observers() {
        notify_dependency_stale(&observer);
    }
}

/// Tell every observer of `observable` that one of its inputs settled.
pub(crate) fn propagate_ready(observable: &Rc<dyn Observable>, changed: bool) {
    for observer in observable.observable_base().collect_observers() {
        notify_dependency_ready(&observer, changed);
    }
}

// =============================================================================
// PER-DERIVATION ACCOUNTING
// =============================================================================

/// One upstream input of `derivation` entered its stale interval. On the
/// 0 -> 1 transition the staleness cascades to the derivation's own
/// observers, blocking their revalidation until this one settles.
pub(crate) fn notify_dependency_stale(derivation: &Rc<dyn Derivation>) {
    let base = derivation.derivation_base();
    let count = base.stale_count() + 1;
    base.set_stale_count(count);
    if count == 1 {
        if let Some(observable) = derivation.as_observable() {
            propagate_stale(&observable);
        }
    }
}

/// One upstream input of `derivation` settled. When the last one does, the
/// derivation revalidates if any input confirmed a change, and releases its
/// own observers with its own changed flag.
pub(crate) fn notify_dependency_ready(derivation: &Rc<dyn Derivation>, changed: bool) {
    let base = derivation.derivation_base();
    if base.stale_count() == 0 {
        // Observer bound mid-wave: it already read the settled value.
        log::trace!(
            "{}: ready notification without a stale interval, ignoring",
            derivation.name()
        );
        return;
    }
    if changed {
        base.set_changed_count(base.changed_count() + 1);
    }
    let count = base.stale_count() - 1;
    base.set_stale_count(count);
    if count == 0 {
        let changes = base.changed_count();
        base.set_changed_count(0);
        let value_changed = derivation.on_dependencies_ready(changes > 0);
        if let Some(observable) = derivation.as_observable() {
            propagate_ready(&observable, value_changed);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
