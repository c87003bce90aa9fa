// ============================================================================
// trellis - Computed Value
// Lazy, memoized derivation that is both observer and observable
// ============================================================================
//
// A computed value has two temperatures. Hot (observed): it sits in the
// graph, its inputs push staleness through it, and reads return the cache.
// Cold (unobserved): it holds no subscriptions and recomputes on every
// read. The transition happens automatically on the observer-set edge.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use crate::core::error::{ReactiveError, Result};
use crate::core::globals::with_globals;
use crate::core::types::{
    Derivation, DerivationBase, EqualsFn, NodeId, Observable, ObservableBase, anonymous_name,
};
use crate::reactivity::batching::run_as_action;
use crate::reactivity::equality::equals;
use crate::reactivity::tracking::{
    clear_observing, panic_payload_message, report_observed, track_derived_function, untracked,
};

// =============================================================================
// OPTIONS
// =============================================================================

/// Construction options for [`Computed`].
pub struct ComputedOptions<T> {
    pub name: Option<String>,
    pub equals: Option<EqualsFn<T>>,
    /// Optional write path; runs inside an action and should push the
    /// change back into the underlying observables.
    pub setter: Option<Box<dyn Fn(T)>>,
}

impl<T> Default for ComputedOptions<T> {
    fn default() -> Self {
        Self {
            name: None,
            equals: None,
            setter: None,
        }
    }
}

// =============================================================================
// COMPUTED CORE
// =============================================================================

pub(crate) struct ComputedCore<T> {
    id: NodeId,
    name: String,
    obs_base: ObservableBase,
    deriv_base: DerivationBase,
    getter: Box<dyn Fn() -> T>,
    setter: Option<Box<dyn Fn(T)>>,
    equals: EqualsFn<T>,

    /// Cached result of the last tracked run.
    value: RefCell<Option<T>>,

    /// Memoized failure; returned from every read until an input changes.
    last_error: RefCell<Option<ReactiveError>>,

    /// Re-entrancy guard: a getter reading its own computed is a cycle.
    is_computing: Cell<bool>,

    /// Whether the dependency set is currently bound (hot).
    tracked: Cell<bool>,

    self_weak: RefCell<Weak<ComputedCore<T>>>,
}

impl<T: Clone + 'static> ComputedCore<T> {
    /// Re-run the getter under tracking, rebind dependencies, refresh the
    /// cache. Returns whether the visible result (value or error) changed.
    fn recompute(this: &Rc<Self>) -> bool {
        log::trace!("{}: recomputing", this.name);
        let had_error = this.last_error.borrow_mut().take().is_some();
        this.is_computing.set(true);
        with_globals(|g| g.enter_computation());

        let derivation: Rc<dyn Derivation> = this.clone();
        let result = track_derived_function(&derivation, || (this.getter)());

        with_globals(|g| g.exit_computation());
        this.is_computing.set(false);
        this.tracked.set(true);

        match result {
            Ok(new_value) => {
                // A successful run supersedes anything memoized by nested
                // reads the getter chose to swallow.
                *this.last_error.borrow_mut() = None;
                let value_differs = {
                    let current = this.value.borrow();
                    match current.as_ref() {
                        Some(old) => !(this.equals)(old, &new_value),
                        None => true,
                    }
                };
                let changed = value_differs || had_error;
                if value_differs {
                    *this.value.borrow_mut() = Some(new_value);
                }
                changed
            }
            Err(payload) => {
                // A nested self-read may already have memoized a precise
                // error; prefer it over the unwound payload.
                let error = this.last_error.borrow().clone().unwrap_or_else(|| {
                    ReactiveError::ComputedPanicked {
                        name: this.name.clone(),
                        message: panic_payload_message(&payload),
                    }
                });
                log::debug!("{}: getter failed: {error}", this.name);
                *this.last_error.borrow_mut() = Some(error);
                true
            }
        }
    }

    /// Detached read: run the getter without joining the graph and without
    /// leaking its reads into whoever is currently tracking.
    fn compute_untracked(&self) -> Result<T> {
        self.is_computing.set(true);
        with_globals(|g| g.enter_computation());
        let result = catch_unwind(AssertUnwindSafe(|| untracked(|| (self.getter)())));
        with_globals(|g| g.exit_computation());
        self.is_computing.set(false);

        match result {
            Ok(value) => Ok(value),
            Err(payload) => {
                let memoized = self.last_error.borrow_mut().take();
                Err(
                    memoized.unwrap_or_else(|| ReactiveError::ComputedPanicked {
                        name: self.name.clone(),
                        message: panic_payload_message(&payload),
                    }),
                )
            }
        }
    }

    /// Whether the cache can be trusted for a graph read.
    fn should_compute(&self) -> bool {
        !self.tracked.get()
            || self.deriv_base.changed_count() != 0
            || (self.value.borrow().is_none() && self.last_error.borrow().is_none())
    }

    fn current_value(&self) -> Result<T> {
        if let Some(error) = self.last_error.borrow().as_ref() {
            return Err(error.clone());
        }
        self.value.borrow().as_ref().cloned().ok_or_else(|| {
            ReactiveError::InvariantViolation {
                message: format!(
                    "computed value '{}' holds neither a value nor an error",
                    self.name
                ),
            }
        })
    }

    /// Drop all subscriptions and go cold. The cache stays but is no longer
    /// trusted; the next read recomputes.
    fn suspend(&self) {
        if !self.tracked.get() {
            return;
        }
        log::trace!("{}: suspending, no observers left", self.name);
        self.tracked.set(false);
        if let Some(rc) = self.self_weak.borrow().upgrade() {
            let derivation: Rc<dyn Derivation> = rc;
            clear_observing(&derivation);
        }
    }

    fn upgrade(&self) -> Option<Rc<ComputedCore<T>>> {
        self.self_weak.borrow().upgrade()
    }
}

impl<T: Clone + 'static> Observable for ComputedCore<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn observable_base(&self) -> &ObservableBase {
        &self.obs_base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_derivation(&self) -> Option<Rc<dyn Derivation>> {
        self.upgrade().map(|rc| rc as Rc<dyn Derivation>)
    }

    fn on_become_unobserved(&self) {
        self.suspend();
    }
}

impl<T: Clone + 'static> Derivation for ComputedCore<T> {
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

    fn as_observable(&self) -> Option<Rc<dyn Observable>> {
        self.upgrade().map(|rc| rc as Rc<dyn Observable>)
    }

    fn on_dependencies_ready(&self, any_changed: bool) -> bool {
        if !any_changed || !self.tracked.get() {
            return false;
        }
        match self.upgrade() {
            Some(rc) => Self::recompute(&rc),
            None => false,
        }
    }
}

// =============================================================================
// COMPUTED HANDLE
// =============================================================================

/// A value derived from other observables through a pure getter.
///
/// # Example
/// ```
/// use trellis::{computed, observable};
///
/// let price = observable(10);
/// let qty = observable(3);
///
/// let (p, q) = (price.clone(), qty.clone());
/// let total = computed(move || p.get() * q.get());
/// assert_eq!(total.get(), 30);
///
/// price.set(20);
/// assert_eq!(total.get(), 60);
/// ```
pub struct Computed<T> {
    inner: Rc<ComputedCore<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Computed<T> {
    /// Create a computed value with the default (structural) equality.
    pub fn new(getter: impl Fn() -> T + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::with_options(getter, ComputedOptions::default())
    }

    /// Create a computed value with an explicit name, equality predicate or
    /// setter.
    pub fn with_options(getter: impl Fn() -> T + 'static, options: ComputedOptions<T>) -> Self
    where
        T: PartialEq,
    {
        Self::build(
            Box::new(getter),
            options.name,
            options.equals.unwrap_or(equals::<T>),
            options.setter,
        )
    }

    /// Create a computed value with a custom equality predicate; no
    /// `PartialEq` bound required.
    pub fn with_equals(getter: impl Fn() -> T + 'static, equals: EqualsFn<T>) -> Self {
        Self::build(Box::new(getter), None, equals, None)
    }

    fn build(
        getter: Box<dyn Fn() -> T>,
        name: Option<String>,
        equals: EqualsFn<T>,
        setter: Option<Box<dyn Fn(T)>>,
    ) -> Self {
        let id = with_globals(|g| g.next_node_id());
        let name = name.unwrap_or_else(|| anonymous_name("Computed", id));
        let inner = Rc::new(ComputedCore {
            id,
            name,
            obs_base: ObservableBase::new(),
            deriv_base: DerivationBase::new(),
            getter,
            setter,
            equals,
            value: RefCell::new(None),
            last_error: RefCell::new(None),
            is_computing: Cell::new(false),
            tracked: Cell::new(false),
            self_weak: RefCell::new(Weak::new()),
        });
        *inner.self_weak.borrow_mut() = Rc::downgrade(&inner);
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Read the computed value.
    ///
    /// # Panics
    /// Panics when the computation failed: a dependency cycle, or a getter
    /// panic memoized from an earlier read.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible read. Three regimes:
    ///
    /// - observed, or read under tracking, or read inside a transaction:
    ///   joins the graph and returns the cache unless an input changed;
    /// - mid-wave read of a node whose inputs are still settling: a
    ///   detached computation against the committed values;
    /// - detached read (no observers, no tracker, no transaction):
    ///   recomputes on every call without binding anything.
    pub fn try_get(&self) -> Result<T> {
        let core = &self.inner;
        if core.is_computing.get() {
            let error = ReactiveError::CycleDetected {
                name: core.name.clone(),
            };
            *core.last_error.borrow_mut() = Some(error.clone());
            return Err(error);
        }

        let (tracking, in_batch) = with_globals(|g| (g.has_tracking(), g.is_batching()));
        if !tracking && !in_batch && !core.obs_base.has_observers() {
            return core.compute_untracked();
        }

        report_observed(&(core.clone() as Rc<dyn Observable>));

        if core.deriv_base.stale_count() > 0 {
            // Mid-wave read while this node's inputs are still settling:
            // serve a detached computation against the already-committed
            // values. The pending ready notification performs the single
            // tracked revalidation; bindings only change there.
            return core.compute_untracked();
        }
        if core.should_compute() {
            ComputedCore::recompute(core);
        }

        core.current_value()
    }

    /// Write through the setter.
    ///
    /// # Panics
    /// Panics when no setter was configured.
    pub fn set(&self, value: T) {
        self.try_set(value).unwrap_or_else(|err| panic!("{err}"));
    }

    /// Fallible variant of [`Computed::set`]; the setter runs inside an
    /// action.
    pub fn try_set(&self, value: T) -> Result<()> {
        match &self.inner.setter {
            Some(setter) => {
                run_as_action(&format!("{}-set", self.inner.name), || setter(value));
                Ok(())
            }
            None => Err(ReactiveError::InvariantViolation {
                message: format!("computed value '{}' has no setter", self.inner.name),
            }),
        }
    }

    pub fn is_being_observed(&self) -> bool {
        self.inner.obs_base.has_observers()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.obs_base.observer_count()
    }

    /// Type-erased observable view for graph operations and introspection.
    pub fn as_observable(&self) -> Rc<dyn Observable> {
        self.inner.clone()
    }

    /// Type-erased derivation view for graph operations and introspection.
    pub fn as_derivation(&self) -> Rc<dyn Derivation> {
        self.inner.clone()
    }
}

impl<T: Clone + 'static> std::fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("name", &self.inner.name)
            .field("observers", &self.inner.obs_base.observer_count())
            .finish()
    }
}

/// Create a computed value; shorthand for [`Computed::new`].
pub fn computed<T, F>(getter: F) -> Computed<T>
where
    T: Clone + PartialEq + 'static,
    F: Fn() -> T + 'static,
{
    Computed::new(getter)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observables::value::observable;
    use crate::reactivity::reaction::autorun;
    use std::cell::Cell;

    #[test]
    fn computes_from_inputs() {
        let x = observable(1);
        let x2 = x.clone();
        let double = computed(move || x2.get() * 2);
        assert_eq!(double.get(), 2);

        x.set(5);
        assert_eq!(double.get(), 10);
    }

    #[test]
    fn detached_reads_recompute_every_time() {
        let runs = Rc::new(Cell::new(0u32));
        let runs2 = runs.clone();
        let c = computed(move || {
            runs2.set(runs2.get() + 1);
            42
        });

        assert_eq!(c.get(), 42);
        assert_eq!(c.get(), 42);
        assert_eq!(runs.get(), 2);
        assert!(!c.is_being_observed());
    }

    #[test]
    fn observed_reads_hit_the_cache() {
        let x = observable(1);
        let runs = Rc::new(Cell::new(0u32));

        let (x2, runs2) = (x.clone(), runs.clone());
        let c = computed(move || {
            runs2.set(runs2.get() + 1);
            x2.get() * 2
        });

        let c2 = c.clone();
        let _r = autorun(move || {
            let _ = c2.get();
        });
        assert_eq!(runs.get(), 1);

        // Cached while nothing changed.
        assert_eq!(c.get(), 2);
        assert_eq!(c.get(), 2);
        assert_eq!(runs.get(), 1);

        // One recomputation per change.
        x.set(3);
        assert_eq!(c.get(), 6);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn going_unobserved_suspends_subscriptions() {
        let x = observable(1);
        let x2 = x.clone();
        let c = computed(move || x2.get() * 2);

        let c2 = c.clone();
        let r = autorun(move || {
            let _ = c2.get();
        });
        assert!(c.is_being_observed());
        assert_eq!(x.observer_count(), 1);

        r.dispose();
        assert!(!c.is_being_observed());
        assert_eq!(x.observer_count(), 0);

        // Cold again: reads still work.
        x.set(4);
        assert_eq!(c.get(), 8);
    }

    #[test]
    fn chained_computeds_propagate() {
        let x = observable(1);
        let x2 = x.clone();
        let double = computed(move || x2.get() * 2);
        let d2 = double.clone();
        let plus_ten = computed(move || d2.get() + 10);

        assert_eq!(plus_ten.get(), 12);
        x.set(5);
        assert_eq!(plus_ten.get(), 20);
    }

    #[test]
    fn self_read_is_a_cycle() {
        let slot: Rc<RefCell<Option<Computed<i32>>>> = Rc::new(RefCell::new(None));
        let slot2 = slot.clone();
        let c = computed(move || slot2.borrow().as_ref().unwrap().get() + 1);
        *slot.borrow_mut() = Some(c.clone());

        let result = c.try_get();
        assert!(matches!(result, Err(ReactiveError::CycleDetected { .. })));
        // Break the Rc loop held through the getter.
        slot.borrow_mut().take();
    }

    #[test]
    fn getter_panic_is_memoized_until_inputs_change() {
        let broken = observable(true);
        let b2 = broken.clone();
        let c = computed(move || {
            if b2.get() {
                panic!("deliberate failure");
            }
            7
        });

        let c2 = c.clone();
        let _r = autorun(move || {
            let _ = c2.try_get();
        });

        let first = c.try_get();
        assert!(matches!(
            first,
            Err(ReactiveError::ComputedPanicked { .. })
        ));
        // Memoized: same error again without re-running the getter.
        assert_eq!(c.try_get(), first);

        // Input change clears the failure.
        broken.set(false);
        assert_eq!(c.try_get(), Ok(7));
    }

    #[test]
    fn setter_writes_back_through_an_action() {
        let celsius = observable(0.0f64);
        let c2 = celsius.clone();
        let c3 = celsius.clone();
        let fahrenheit = Computed::with_options(
            move || c2.get() * 9.0 / 5.0 + 32.0,
            ComputedOptions {
                name: Some("fahrenheit".into()),
                setter: Some(Box::new(move |f: f64| {
                    c3.set((f - 32.0) * 5.0 / 9.0);
                })),
                ..Default::default()
            },
        );

        assert_eq!(fahrenheit.get(), 32.0);
        fahrenheit.set(212.0);
        assert_eq!(celsius.get(), 100.0);
        assert_eq!(fahrenheit.get(), 212.0);
    }

    #[test]
    fn set_without_setter_is_an_error() {
        let c = computed(|| 1);
        assert!(matches!(
            c.try_set(2),
            Err(ReactiveError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn custom_equality_suppresses_downstream_changes() {
        let x = observable(1.0f64);
        let x2 = x.clone();
        let c = Computed::with_equals(move || x2.get().abs(), crate::safe_equals_f64);

        let runs = Rc::new(Cell::new(0u32));
        let (c2, runs2) = (c.clone(), runs.clone());
        let _r = autorun(move || {
            let _ = c2.get();
            runs2.set(runs2.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        // |−1| == |1|: the computed does not report a change.
        x.set(-1.0);
        assert_eq!(runs.get(), 1);
    }
}
