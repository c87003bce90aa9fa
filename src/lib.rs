// ============================================================================
// trellis - Transparent Reactive State for Rust
// ============================================================================
//
// A live dependency graph between three kinds of nodes: atoms (leaf
// observables), computed values (pure derivations) and reactions
// (effectful observers). Writes propagate as a two-phase stale/ready wave,
// so every affected derivation revalidates exactly once per change batch,
// never reads a half-updated graph, and reactions fire only when the
// outermost transaction closes.
//
// ```
// use trellis::{autorun, computed, observable, transaction};
//
// let price = observable(10);
// let qty = observable(2);
//
// let (p, q) = (price.clone(), qty.clone());
// let total = computed(move || p.get() * q.get());
//
// let t = total.clone();
// let _logger = autorun(move || println!("total: {}", t.get()));
//
// transaction(|| {
//     price.set(12);
//     qty.set(3);
// }); // the logger runs once, with both writes applied
// ```
// ============================================================================

pub mod core;
pub mod introspection;
pub mod observables;
pub mod reactivity;

// Re-export the working surface at the crate root.
pub use crate::core::error::{ReactiveError, Result};
pub use crate::core::globals::{
    GlobalState, in_action, is_batching, is_strict_mode, is_tracking, reset_global_state,
    set_strict_mode, with_globals,
};
pub use crate::core::types::{
    Derivation, DerivationBase, EqualsFn, NodeId, Observable, ObservableBase,
};

pub use crate::observables::atom::{Atom, AtomHook, atom};
pub use crate::observables::computed::{Computed, ComputedOptions, computed};
pub use crate::observables::value::{EnhancerFn, ObservableValue, ValueOptions, observable};

pub use crate::reactivity::batching::{
    action, end_batch, run_as_action, start_batch, transaction,
};
pub use crate::reactivity::equality::{
    always_equals, equals, never_equals, safe_equals_f32, safe_equals_f64, shallow_equals_vec,
};
pub use crate::reactivity::reaction::{
    MAX_REACTION_ITERATIONS, Reaction, autorun, autorun_named, run_reactions,
};
pub use crate::reactivity::tracking::{allow_state_changes, report_observed, untracked};

pub use crate::introspection::spy::{SpyEvent, SpyHandle, spy};
pub use crate::introspection::trees::{
    DependencyTree, ObserverTree, get_dependency_tree, get_observer_tree,
};

// =============================================================================
// TESTS
// =============================================================================
