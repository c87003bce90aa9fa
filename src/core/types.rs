// ============================================================================
// trellis - Type Definitions
// Type-erased traits and shared bookkeeping for the reactive graph
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

// =============================================================================
// TYPE-ERASED TRAITS
// =============================================================================
//
// The graph is bipartite: observables (atoms, observable values, computed
// values) know their observers, derivations (computed values, reactions)
// know what they observe. Graph operations never need the value type T, so
// nodes are stored as Rc<dyn Observable> / Weak<dyn Derivation>. Edges are
// strong downward (derivation -> its inputs) and weak upward (observable ->
// its observers), which keeps the back-pointer graph cycle-free for Rc.
// =============================================================================

/// Unique identifier assigned to every node at construction.
pub type NodeId = u64;

/// Equality predicate used to decide whether a write actually changed a value.
pub type EqualsFn<T> = fn(&T, &T) -> bool;

/// A node that can be observed: atoms, observable values, computed values.
pub trait Observable: Any {
    /// Stable identifier of this node.
    fn id(&self) -> NodeId;

    /// Human-readable node name, used in errors, spy events and trees.
    fn name(&self) -> &str;

    /// Shared observer-side bookkeeping.
    fn observable_base(&self) -> &ObservableBase;

    /// Upcast for downcasting in tests and tooling.
    fn as_any(&self) -> &dyn Any;

    /// Computed values are observable *and* derive; everything else is not.
    fn as_derivation(&self) -> Option<Rc<dyn Derivation>> {
        None
    }

    /// Called when the observer set transitions empty -> non-empty.
    fn on_become_observed(&self) {}

    /// Called when the observer set transitions non-empty -> empty.
    fn on_become_unobserved(&self) {}
}

/// A node whose value is a function of other nodes: computed values and
/// reactions.
pub trait Derivation: Any {
    /// Stable identifier of this node.
    fn id(&self) -> NodeId;

    /// Human-readable node name.
    fn name(&self) -> &str;

    /// Shared dependency-side bookkeeping.
    fn derivation_base(&self) -> &DerivationBase;

    /// Upcast for downcasting in tests and tooling.
    fn as_any(&self) -> &dyn Any;

    /// Computed values derive *and* are observable; reactions are terminals.
    fn as_observable(&self) -> Option<Rc<dyn Observable>> {
        None
    }

    /// All upstream dependencies have settled; `any_changed` says whether
    /// at least one confirmed a new value. Computed values revalidate here
    /// and return whether their own value changed; reactions schedule
    /// themselves and return `false`.
    fn on_dependencies_ready(&self, any_changed: bool) -> bool;
}

// =============================================================================
// OBSERVABLE BASE
// =============================================================================

/// Observer-side bookkeeping embedded in every observable node.
pub struct ObservableBase {
    /// Observers, weak so that dropping the last derivation handle ends it.
    observers: RefCell<Vec<Weak<dyn Derivation>>>,

    /// Scratch counter used only during dependency binding. Zero at rest,
    /// so the bind pass never needs a reset sweep.
    diff_value: Cell<i32>,

    /// Run id of the last tracking run that read this node; deduplicates
    /// repeated reads within a single run.
    last_accessed_by: Cell<u64>,
}

impl ObservableBase {
    pub fn new() -> Self {
        Self {
            observers: RefCell::new(Vec::new()),
            diff_value: Cell::new(0),
            last_accessed_by: Cell::new(0),
        }
    }

    pub(crate) fn diff_value(&self) -> i32 {
        self.diff_value.get()
    }

    pub(crate) fn set_diff_value(&self, value: i32) {
        self.diff_value.set(value);
    }

    pub(crate) fn last_accessed_by(&self) -> u64 {
        self.last_accessed_by.get()
    }

    pub(crate) fn set_last_accessed_by(&self, run_id: u64) {
        self.last_accessed_by.set(run_id);
    }

    /// Number of live observers. Dead weak entries are pruned on the way.
    pub fn observer_count(&self) -> usize {
        self.prune_dead_observers();
        self.observers.borrow().len()
    }

    pub fn has_observers(&self) -> bool {
        self.observer_count() > 0
    }

    pub(crate) fn push_observer(&self, observer: Weak<dyn Derivation>) {
        self.observers.borrow_mut().push(observer);
    }

    /// Remove a specific observer by allocation identity. Returns whether a
    /// live entry was removed; dead entries are pruned as a side effect.
    pub(crate) fn remove_observer(&self, observer: &Rc<dyn Derivation>) -> bool {
        let target = Rc::as_ptr(observer) as *const ();
        let mut removed = false;
        self.observers.borrow_mut().retain(|weak| {
            if let Some(rc) = weak.upgrade() {
                let ptr = Rc::as_ptr(&rc) as *const ();
                if ptr == target {
                    removed = true;
                    false
                } else {
                    true
                }
            } else {
                false
            }
        });
        removed
    }

    /// Snapshot the live observers so callers can iterate without holding
    /// the borrow while observer code mutates the graph.
    pub(crate) fn collect_observers(&self) -> Vec<Rc<dyn Derivation>> {
        self.observers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn prune_dead_observers(&self) {
        self.observers
            .borrow_mut()
            .retain(|weak| weak.strong_count() > 0);
    }
}

impl Default for ObservableBase {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// DERIVATION BASE
// =============================================================================

/// Inline capacity for dependency lists; most derivations read a handful of
/// nodes per run.
pub(crate) type ObservingList = SmallVec<[Rc<dyn Observable>; 4]>;

/// Dependency-side bookkeeping embedded in every derivation.
pub struct DerivationBase {
    /// Nodes read during the last tracked run, in access order.
    observing: RefCell<ObservingList>,

    /// Monotonic id of the current/last tracking run.
    run_id: Cell<u64>,

    /// Upstream dependencies currently between their stale and ready
    /// notifications. Zero outside a propagation wave.
    stale_count: Cell<i32>,

    /// Upstream dependencies that confirmed an actual new value during the
    /// current stale interval.
    changed_count: Cell<i32>,
}

impl DerivationBase {
    pub fn new() -> Self {
        Self {
            observing: RefCell::new(SmallVec::new()),
            run_id: Cell::new(0),
            stale_count: Cell::new(0),
            changed_count: Cell::new(0),
        }
    }

    pub(crate) fn run_id(&self) -> u64 {
        self.run_id.get()
    }

    pub(crate) fn set_run_id(&self, run_id: u64) {
        self.run_id.set(run_id);
    }

    pub fn stale_count(&self) -> i32 {
        self.stale_count.get()
    }

    pub(crate) fn set_stale_count(&self, count: i32) {
        self.stale_count.set(count);
    }

    pub fn changed_count(&self) -> i32 {
        self.changed_count.get()
    }

    pub(crate) fn set_changed_count(&self, count: i32) {
        self.changed_count.set(count);
    }

    pub fn observing_len(&self) -> usize {
        self.observing.borrow().len()
    }

    pub(crate) fn push_observing(&self, observable: Rc<dyn Observable>) {
        self.observing.borrow_mut().push(observable);
    }

    pub(crate) fn take_observing(&self) -> ObservingList {
        self.observing.replace(SmallVec::new())
    }

    pub(crate) fn set_observing(&self, observing: ObservingList) {
        *self.observing.borrow_mut() = observing;
    }

    /// Snapshot the dependency list for iteration outside the borrow.
    pub(crate) fn observing_snapshot(&self) -> Vec<Rc<dyn Observable>> {
        self.observing.borrow().iter().cloned().collect()
    }
}

impl Default for DerivationBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Default name for nodes constructed without one.
pub(crate) fn anonymous_name(kind: &str, id: NodeId) -> String {
    format!("{kind}@{id}")
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observables::atom::Atom;
    use crate::reactivity::reaction::Reaction;

    #[test]
    fn observable_base_starts_clean() {
        let base = ObservableBase::new();
        assert_eq!(base.observer_count(), 0);
        assert!(!base.has_observers());
        assert_eq!(base.diff_value(), 0);
        assert_eq!(base.last_accessed_by(), 0);
    }

    #[test]
    fn observer_list_add_and_remove() {
        let base = ObservableBase::new();
        let reaction = Reaction::new("r", |_| {});
        let derivation = reaction.as_derivation();

        base.push_observer(Rc::downgrade(&derivation));
        assert_eq!(base.observer_count(), 1);

        assert!(base.remove_observer(&derivation));
        assert_eq!(base.observer_count(), 0);

        // Removing again is a no-op.
        assert!(!base.remove_observer(&derivation));
    }

    #[test]
    fn dead_observers_are_pruned() {
        let base = ObservableBase::new();
        {
            let reaction = Reaction::new("short-lived", |_| {});
            base.push_observer(Rc::downgrade(&reaction.as_derivation()));
            assert_eq!(base.observer_count(), 1);
        }
        // Handle dropped; weak entry disappears on next count.
        assert_eq!(base.observer_count(), 0);
    }

    #[test]
    fn derivation_base_counters() {
        let base = DerivationBase::new();
        assert_eq!(base.stale_count(), 0);
        assert_eq!(base.changed_count(), 0);

        base.set_stale_count(2);
        base.set_changed_count(1);
        assert_eq!(base.stale_count(), 2);
        assert_eq!(base.changed_count(), 1);
    }

    #[test]
    fn observing_list_roundtrip() {
        let base = DerivationBase::new();
        let atom = Atom::new("a");
        base.push_observing(atom.as_observable());
        assert_eq!(base.observing_len(), 1);

        let taken = base.take_observing();
        assert_eq!(taken.len(), 1);
        assert_eq!(base.observing_len(), 0);

        base.set_observing(taken);
        assert_eq!(base.observing_len(), 1);
    }

    #[test]
    fn anonymous_names_carry_kind_and_id() {
        assert_eq!(anonymous_name("Atom", 7), "Atom@7");
    }
}
