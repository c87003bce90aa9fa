// ============================================================================
// trellis - Spy Channel
// Structured runtime events for devtools and tests
// ============================================================================

use std::rc::Rc;

use crate::core::globals::with_globals;

// =============================================================================
// EVENTS
// =============================================================================

/// Events emitted by the runtime. Nested phases (actions, reaction runs)
/// are bracketed: a start variant, the nested events, then [`SpyEvent::End`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpyEvent {
    /// An action began.
    ActionStart { name: String },
    /// A reaction's tracked body began.
    ReactionStart { name: String },
    /// A reaction was queued for the next drain.
    ReactionScheduled { name: String },
    /// An observable value accepted a write.
    Update { name: String },
    /// A reaction body failed; the runtime carried on.
    Error { name: String, message: String },
    /// Closes the most recent unclosed start event.
    End,
}

// =============================================================================
// LISTENER REGISTRY
// =============================================================================

/// Keeps a spy listener registered; the listener is removed when the handle
/// is disposed or dropped.
pub struct SpyHandle {
    id: Option<usize>,
}

impl SpyHandle {
    /// Stop receiving events.
    pub fn dispose(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(id) = self.id.take() {
            with_globals(|g| g.remove_spy_listener(id));
        }
    }
}

impl Drop for SpyHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Subscribe to the runtime event stream.
///
/// # Example
/// ```
/// use trellis::{observable, spy, SpyEvent};
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let seen2 = seen.clone();
/// let _handle = spy(move |event| {
///     if let SpyEvent::Update { name } = event {
///         seen2.borrow_mut().push(name.clone());
///     }
/// });
///
/// let v = observable(1);
/// v.set(2);
/// assert_eq!(seen.borrow().len(), 1);
/// ```
pub fn spy(listener: impl Fn(&SpyEvent) + 'static) -> SpyHandle {
    let id = with_globals(|g| g.add_spy_listener(Rc::new(listener)));
    SpyHandle { id: Some(id) }
}

// =============================================================================
// EMISSION
// =============================================================================

fn deliver(event: &SpyEvent) {
    let listeners = with_globals(|g| {
        if g.has_spy_listeners() {
            g.spy_listeners_snapshot()
        } else {
            Vec::new()
        }
    });
    for listener in listeners {
        listener(event);
    }
}

/// Emit a stand-alone event.
pub(crate) fn spy_report(event: SpyEvent) {
    deliver(&event);
}

/// Open a bracketed phase.
pub(crate) fn spy_report_start(event: SpyEvent) {
    deliver(&event);
}

/// Close the most recent bracketed phase.
pub(crate) fn spy_report_end() {
    deliver(&SpyEvent::End);
}

// =============================================================================
// TESTS
// =============================================================================
