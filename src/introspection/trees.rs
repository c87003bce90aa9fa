// ============================================================================
// trellis - Graph Trees
// Dependency and observer trees for devtools
// ============================================================================

use std::rc::Rc;

use rustc_hash::FxHashSet;

use crate::core::types::{Derivation, NodeId, Observable};

// =============================================================================
// TREE SHAPES
// =============================================================================

/// What a derivation observes, transitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTree {
    pub name: String,
    pub dependencies: Vec<DependencyTree>,
}

/// What observes an observable, transitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverTree {
    pub name: String,
    pub observers: Vec<ObserverTree>,
}

// =============================================================================
// WALKS
// =============================================================================

/// Everything `derivation` currently observes, one node per distinct id.
/// A node revisited along another path appears as a leaf.
pub fn get_dependency_tree(derivation: &Rc<dyn Derivation>) -> DependencyTree {
    let mut visited = FxHashSet::default();
    dependency_tree(derivation, &mut visited)
}

fn dependency_tree(
    derivation: &Rc<dyn Derivation>,
    visited: &mut FxHashSet<NodeId>,
) -> DependencyTree {
    visited.insert(derivation.id());
    let dependencies = derivation
        .derivation_base()
        .observing_snapshot()
        .iter()
        .map(|observable| match observable.as_derivation() {
            Some(inner) if !visited.contains(&inner.id()) => {
                dependency_tree(&inner, visited)
            }
            _ => DependencyTree {
                name: observable.name().to_string(),
                dependencies: Vec::new(),
            },
        })
        .collect();
    DependencyTree {
        name: derivation.name().to_string(),
        dependencies,
    }
}

/// Everything currently observing `observable`, one node per distinct id.
pub fn get_observer_tree(observable: &Rc<dyn Observable>) -> ObserverTree {
    let mut visited = FxHashSet::default();
    observer_tree(observable, &mut visited)
}

fn observer_tree(observable: &Rc<dyn Observable>, visited: &mut FxHashSet<NodeId>) -> ObserverTree {
    visited.insert(observable.id());
    let observers = observable
        .observable_base()
        .collect_observers()
        .iter()
        .map(|derivation| match derivation.as_observable() {
            Some(inner) if !visited.contains(&inner.id()) => {
                observer_tree(&inner, visited)
            }
            _ => ObserverTree {
                name: derivation.name().to_string(),
                observers: Vec::new(),
            },
        })
        .collect();
    ObserverTree {
        name: observable.name().to_string(),
        observers,
    }
}

// =============================================================================
// TESTS
// =============================================================================
