// ============================================================================
// trellis - Observable Value
// An atom paired with a held value: the entry point for mutation
// ============================================================================

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::core::error::Result;
use crate::core::globals::with_globals;
use crate::core::types::{EqualsFn, NodeId, Observable, ObservableBase, anonymous_name};
use crate::introspection::spy::{SpyEvent, spy_report};
use crate::reactivity::equality::equals;
use crate::reactivity::propagation::broadcast_change;
use crate::reactivity::tracking::{check_state_changes_allowed, report_observed};

// =============================================================================
// OPTIONS
// =============================================================================

/// Wraps a freshly assigned value before it is stored, so nested structures
/// can be made observable by upper layers.
pub type EnhancerFn<T> = Box<dyn Fn(T) -> T>;

/// Construction options for [`ObservableValue`].
pub struct ValueOptions<T> {
    pub name: Option<String>,
    pub equals: Option<EqualsFn<T>>,
    pub enhancer: Option<EnhancerFn<T>>,
}

impl<T> Default for ValueOptions<T> {
    fn default() -> Self {
        Self {
            name: None,
            equals: None,
            enhancer: None,
        }
    }
}

// =============================================================================
// VALUE CORE
// =============================================================================

struct ValueCore<T> {
    id: NodeId,
    name: String,
    base: ObservableBase,
    value: RefCell<T>,
    equals: EqualsFn<T>,
    enhancer: Option<EnhancerFn<T>>,
}

impl<T: 'static> Observable for ValueCore<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn observable_base(&self) -> &ObservableBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// OBSERVABLE VALUE HANDLE
// =============================================================================

/// A mutable reactive value. Reads register with the tracking derivation;
/// writes run through the equality predicate and, when they stick, push a
/// stale/ready wave through every downstream derivation.
///
/// # Example
/// ```
/// use trellis::observable;
///
/// let count = observable(0);
/// assert_eq!(count.get(), 0);
///
/// assert!(count.set(5));
/// assert!(!count.set(5)); // same value, nobody wakes up
/// ```
pub struct ObservableValue<T> {
    inner: Rc<ValueCore<T>>,
}

impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> ObservableValue<T> {
    /// Create an observable value with the default (structural) equality.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_options(value, ValueOptions::default())
    }

    /// Create an observable value with an explicit name, equality predicate
    /// or enhancer.
    pub fn with_options(value: T, options: ValueOptions<T>) -> Self
    where
        T: PartialEq,
    {
        Self::build(
            value,
            options.name,
            options.equals.unwrap_or(equals::<T>),
            options.enhancer,
        )
    }

    /// Create an observable value with a custom equality predicate; no
    /// `PartialEq` bound required.
    pub fn with_equals(value: T, equals: EqualsFn<T>) -> Self {
        Self::build(value, None, equals, None)
    }

    fn build(
        value: T,
        name: Option<String>,
        equals: EqualsFn<T>,
        enhancer: Option<EnhancerFn<T>>,
    ) -> Self {
        let id = with_globals(|g| g.next_node_id());
        let name = name.unwrap_or_else(|| anonymous_name("ObservableValue", id));
        let value = match &enhancer {
            Some(enhance) => enhance(value),
            None => value,
        };
        Self {
            inner: Rc::new(ValueCore {
                id,
                name,
                base: ObservableBase::new(),
                value: RefCell::new(value),
                equals,
                enhancer,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Read the current value, registering it with the tracking derivation.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        report_observed(&self.as_observable());
        self.inner.value.borrow().clone()
    }

    /// Read through a closure without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        report_observed(&self.as_observable());
        f(&self.inner.value.borrow())
    }

    /// Write a new value. Returns whether the value actually changed.
    ///
    /// # Panics
    /// Panics when state mutation is currently forbidden (strict mode
    /// outside an action, or inside a computed value).
    pub fn set(&self, value: T) -> bool {
        self.try_set(value).unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible variant of [`ObservableValue::set`].
    pub fn try_set(&self, value: T) -> Result<bool> {
        check_state_changes_allowed(&self.inner.name)?;
        match self.prepare_new_value(value) {
            Some(accepted) => {
                self.set_new_value(accepted);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mutate the value in place and broadcast unconditionally; in-place
    /// edits cannot be compared against the previous state.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        check_state_changes_allowed(&self.inner.name).unwrap_or_else(|err| panic!("{err}"));
        spy_report(SpyEvent::Update {
            name: self.inner.name.clone(),
        });
        broadcast_change(&self.as_observable(), || {
            f(&mut self.inner.value.borrow_mut());
        });
    }

    /// Run the enhancer and the equality predicate over a candidate value.
    /// Returns `None` when the write is a no-op.
    pub fn prepare_new_value(&self, value: T) -> Option<T> {
        let value = match &self.inner.enhancer {
            Some(enhance) => enhance(value),
            None => value,
        };
        let unchanged = (self.inner.equals)(&self.inner.value.borrow(), &value);
        if unchanged { None } else { Some(value) }
    }

    /// Commit a prepared value and broadcast the change. The commit happens
    /// between the stale and ready waves, so observers revalidate against
    /// the new state only.
    pub fn set_new_value(&self, value: T) {
        spy_report(SpyEvent::Update {
            name: self.inner.name.clone(),
        });
        broadcast_change(&self.as_observable(), || {
            *self.inner.value.borrow_mut() = value;
        });
    }

    pub fn is_being_observed(&self) -> bool {
        self.inner.base.has_observers()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.base.observer_count()
    }

    /// Type-erased view for graph operations and introspection.
    pub fn as_observable(&self) -> Rc<dyn Observable> {
        self.inner.clone()
    }
}

impl<T: Clone + std::fmt::Debug + 'static> std::fmt::Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableValue")
            .field("name", &self.inner.name)
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

/// Create an observable value; shorthand for [`ObservableValue::new`].
pub fn observable<T: PartialEq + 'static>(value: T) -> ObservableValue<T> {
    ObservableValue::new(value)
}

// =============================================================================
// TESTS
// =============================================================================
