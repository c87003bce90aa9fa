// ============================================================================
// trellis - Global Runtime State
// Thread-local context shared by every node on the current thread
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::types::{Derivation, NodeId};
use crate::introspection::spy::SpyEvent;
use crate::reactivity::reaction::ReactionCore;

// =============================================================================
// GLOBAL STATE
// =============================================================================

/// Thread-local state of the reactive runtime: the tracking slot, counters,
/// the transaction gate, the pending-reaction queue and the spy channel.
///
/// The core is single-threaded; each thread gets an independent context.
pub struct GlobalState {
    /// Derivation currently collecting dependencies, if any. Nested tracking
    /// runs save and restore the previous holder, so the machine call stack
    /// doubles as the derivation stack.
    tracking: RefCell<Option<Weak<dyn Derivation>>>,

    /// Monotonic id handed to each tracking run.
    run_id: Cell<u64>,

    /// Monotonic id handed to each constructed node.
    next_node_id: Cell<NodeId>,

    /// Open transaction depth. Reactions only run at depth zero.
    batch_depth: Cell<u32>,

    /// Depth of computed-value getters on the call stack. State mutation is
    /// forbidden while this is non-zero.
    computation_depth: Cell<u32>,

    /// Depth of open actions.
    action_depth: Cell<u32>,

    /// Reactions waiting for the current batch to close.
    pending_reactions: RefCell<Vec<Weak<ReactionCore>>>,

    /// True while the reaction runner drains the queue.
    running_reactions: Cell<bool>,

    /// Whether writes to observables are currently permitted.
    allow_state_changes: Cell<bool>,

    /// Strict mode: writes outside actions are rejected.
    strict_mode: Cell<bool>,

    /// Registered spy listeners, keyed for removal.
    spy_listeners: RefCell<Vec<(usize, Rc<dyn Fn(&SpyEvent)>)>>,

    /// Key source for spy listeners.
    next_spy_id: Cell<usize>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self {
            tracking: RefCell::new(None),
            run_id: Cell::new(0),
            next_node_id: Cell::new(0),
            batch_depth: Cell::new(0),
            computation_depth: Cell::new(0),
            action_depth: Cell::new(0),
            pending_reactions: RefCell::new(Vec::new()),
            running_reactions: Cell::new(false),
            allow_state_changes: Cell::new(true),
            strict_mode: Cell::new(false),
            spy_listeners: RefCell::new(Vec::new()),
            next_spy_id: Cell::new(0),
        }
    }

    // =========================================================================
    // TRACKING SLOT
    // =========================================================================

    /// Install a new tracking derivation, returning the previous one.
    pub fn set_tracking(
        &self,
        derivation: Option<Weak<dyn Derivation>>,
    ) -> Option<Weak<dyn Derivation>> {
        self.tracking.replace(derivation)
    }

    /// The derivation currently collecting dependencies, if it is alive.
    pub fn tracking(&self) -> Option<Rc<dyn Derivation>> {
        self.tracking.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn has_tracking(&self) -> bool {
        self.tracking().is_some()
    }

    // =========================================================================
    // COUNTERS
    // =========================================================================

    pub fn next_run_id(&self) -> u64 {
        let id = self.run_id.get() + 1;
        self.run_id.set(id);
        id
    }

    pub fn next_node_id(&self) -> NodeId {
        let id = self.next_node_id.get() + 1;
        self.next_node_id.set(id);
        id
    }

    // =========================================================================
    // BATCHING
    // =========================================================================

    /// Increment transaction depth, returning the new depth.
    pub fn enter_batch(&self) -> u32 {
        let depth = self.batch_depth.get() + 1;
        self.batch_depth.set(depth);
        depth
    }

    /// Decrement transaction depth, returning the new depth.
    pub fn exit_batch(&self) -> u32 {
        let depth = self.batch_depth.get().saturating_sub(1);
        self.batch_depth.set(depth);
        depth
    }

    pub fn batch_depth(&self) -> u32 {
        self.batch_depth.get()
    }

    pub fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0
    }

    // =========================================================================
    // COMPUTATION / ACTION DEPTH
    // =========================================================================

    pub fn enter_computation(&self) {
        self.computation_depth.set(self.computation_depth.get() + 1);
    }

    pub fn exit_computation(&self) {
        self.computation_depth
            .set(self.computation_depth.get().saturating_sub(1));
    }

    pub fn computation_depth(&self) -> u32 {
        self.computation_depth.get()
    }

    pub fn enter_action(&self) {
        self.action_depth.set(self.action_depth.get() + 1);
    }

    pub fn exit_action(&self) {
        self.action_depth
            .set(self.action_depth.get().saturating_sub(1));
    }

    pub fn action_depth(&self) -> u32 {
        self.action_depth.get()
    }

    // =========================================================================
    // MUTATION PERMISSION
    // =========================================================================

    /// Swap the mutation permission flag, returning the previous value.
    pub fn set_allow_state_changes(&self, allow: bool) -> bool {
        self.allow_state_changes.replace(allow)
    }

    pub fn allow_state_changes(&self) -> bool {
        self.allow_state_changes.get()
    }

    pub fn set_strict_mode(&self, enabled: bool) {
        self.strict_mode.set(enabled);
        // Strict mode flips the resting permission; actions scope it back on.
        self.allow_state_changes.set(!enabled);
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode.get()
    }

    // =========================================================================
    // PENDING REACTIONS
    // =========================================================================

    pub fn add_pending_reaction(&self, reaction: Weak<ReactionCore>) {
        self.pending_reactions.borrow_mut().push(reaction);
    }

    pub fn take_pending_reactions(&self) -> Vec<Weak<ReactionCore>> {
        self.pending_reactions.replace(Vec::new())
    }

    pub fn has_pending_reactions(&self) -> bool {
        !self.pending_reactions.borrow().is_empty()
    }

    /// Swap the runner flag, returning the previous value.
    pub fn set_running_reactions(&self, running: bool) -> bool {
        self.running_reactions.replace(running)
    }

    pub fn is_running_reactions(&self) -> bool {
        self.running_reactions.get()
    }

    // =========================================================================
    // SPY CHANNEL
    // =========================================================================

    pub fn add_spy_listener(&self, listener: Rc<dyn Fn(&SpyEvent)>) -> usize {
        let id = self.next_spy_id.get();
        self.next_spy_id.set(id + 1);
        self.spy_listeners.borrow_mut().push((id, listener));
        id
    }

    pub fn remove_spy_listener(&self, id: usize) {
        self.spy_listeners
            .borrow_mut()
            .retain(|(key, _)| *key != id);
    }

    pub fn has_spy_listeners(&self) -> bool {
        !self.spy_listeners.borrow().is_empty()
    }

    /// Snapshot the listeners so events can be delivered without holding the
    /// borrow while listener code runs.
    pub fn spy_listeners_snapshot(&self) -> Vec<Rc<dyn Fn(&SpyEvent)>> {
        self.spy_listeners
            .borrow()
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// THREAD-LOCAL ACCESS
// =============================================================================

thread_local! {
    static GLOBALS: GlobalState = GlobalState::new();
}

/// Access the thread-local runtime context.
pub fn with_globals<R>(f: impl FnOnce(&GlobalState) -> R) -> R {
    GLOBALS.with(f)
}

/// Restore the context to factory defaults: no tracking, empty queue, depth
/// counters at zero, permissive mutation, no spy listeners. Node-id and
/// run-id counters keep advancing so stale ids never collide.
///
/// Used by tests and by recovery after a caught panic.
pub fn reset_global_state() {
    with_globals(|g| {
        g.set_tracking(None);
        g.batch_depth.set(0);
        g.computation_depth.set(0);
        g.action_depth.set(0);
        g.pending_reactions.borrow_mut().clear();
        g.running_reactions.set(false);
        g.strict_mode.set(false);
        g.allow_state_changes.set(true);
        g.spy_listeners.borrow_mut().clear();
    });
}

// =============================================================================
// CONVENIENCE FUNCTIONS
// =============================================================================

/// Whether a derivation is currently collecting dependencies.
pub fn is_tracking() -> bool {
    with_globals(|g| g.has_tracking())
}

/// Whether a transaction is currently open.
pub fn is_batching() -> bool {
    with_globals(|g| g.is_batching())
}

/// Whether an action is currently running.
pub fn in_action() -> bool {
    with_globals(|g| g.action_depth() > 0)
}

/// Forbid (or re-allow) state mutation outside actions, process-wide for
/// the current thread.
pub fn set_strict_mode(enabled: bool) {
    with_globals(|g| g.set_strict_mode(enabled));
}

pub fn is_strict_mode() -> bool {
    with_globals(|g| g.strict_mode())
}

// =============================================================================
// TESTS
// =============================================================================
