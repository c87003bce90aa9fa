// ============================================================================
// trellis - Atom
// Leaf reactive node: source of truth with no value of its own
// ============================================================================

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::core::error::Result;
use crate::core::globals::with_globals;
use crate::core::types::{NodeId, Observable, ObservableBase};
use crate::reactivity::propagation::broadcast_change;
use crate::reactivity::tracking::{check_state_changes_allowed, report_observed};

// =============================================================================
// ATOM CORE
// =============================================================================

/// Hook fired when an atom's observer set crosses empty.
pub type AtomHook = Box<dyn Fn()>;

pub(crate) struct AtomCore {
    id: NodeId,
    name: String,
    base: ObservableBase,
    on_observed: RefCell<Option<AtomHook>>,
    on_unobserved: RefCell<Option<AtomHook>>,
}

impl Observable for AtomCore {
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

    fn on_become_observed(&self) {
        if let Some(hook) = self.on_observed.borrow().as_ref() {
            hook();
        }
    }

    fn on_become_unobserved(&self) {
        if let Some(hook) = self.on_unobserved.borrow().as_ref() {
            hook();
        }
    }
}

// =============================================================================
// ATOM HANDLE
// =============================================================================

/// The leaf node of the dependency graph. Owners call `report_observed`
/// from their read paths and `report_changed` from their write paths;
/// everything else — bookkeeping, staleness, scheduling — is handled here.
///
/// # Example
/// ```
/// use trellis::{Atom, autorun};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let tick = Atom::new("tick");
/// let runs = Rc::new(Cell::new(0));
///
/// let tick2 = tick.clone();
/// let runs2 = runs.clone();
/// let _r = autorun(move || {
///     tick2.report_observed();
///     runs2.set(runs2.get() + 1);
/// });
/// assert_eq!(runs.get(), 1);
///
/// tick.report_changed();
/// assert_eq!(runs.get(), 2);
/// ```
#[derive(Clone)]
pub struct Atom {
    inner: Rc<AtomCore>,
}

impl Atom {
    /// Create a named atom.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_hooks(name, None, None)
    }

    /// Create an atom with hooks fired when it gains its first observer and
    /// loses its last one. Used for lazily acquiring and releasing derived
    /// resources.
    pub fn with_hooks(
        name: impl Into<String>,
        on_observed: Option<AtomHook>,
        on_unobserved: Option<AtomHook>,
    ) -> Self {
        let id = with_globals(|g| g.next_node_id());
        Self {
            inner: Rc::new(AtomCore {
                id,
                name: name.into(),
                base: ObservableBase::new(),
                on_observed: RefCell::new(on_observed),
                on_unobserved: RefCell::new(on_unobserved),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Register a read of this atom with the tracking derivation, if any.
    pub fn report_observed(&self) {
        report_observed(&self.as_observable());
    }

    /// Broadcast that this atom's underlying state changed. Opens a
    /// single-write transaction when called outside one.
    ///
    /// # Panics
    /// Panics when state mutation is currently forbidden (strict mode
    /// outside an action, or inside a computed value).
    pub fn report_changed(&self) {
        self.try_report_changed()
            .unwrap_or_else(|err| panic!("{err}"));
    }

    /// Fallible variant of [`Atom::report_changed`].
    pub fn try_report_changed(&self) -> Result<()> {
        check_state_changes_allowed(&self.inner.name)?;
        broadcast_change(&self.as_observable(), || {});
        Ok(())
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

impl std::fmt::Debug for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atom")
            .field("name", &self.inner.name)
            .field("observers", &self.inner.base.observer_count())
            .finish()
    }
}

/// Create a named atom; shorthand for [`Atom::new`].
pub fn atom(name: impl Into<String>) -> Atom {
    Atom::new(name)
}

// =============================================================================
// TESTS
// =============================================================================
