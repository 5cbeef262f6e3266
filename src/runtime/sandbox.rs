//! The assembly sandbox.
//!
//! Holds the named assemblies of one dashboard and the dependency DAG
//! between them (mirrors, concatenations, nested queries). A
//! read/write lock guards the whole graph: the planner holds the read
//! side for the full duration of building a lens, so no concurrent
//! edit can shear the assembly set out from under it. Guards are RAII;
//! every exit path, including panics, releases them.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::model::TableAssembly;
use crate::planner::AssemblyLookup;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("assembly '{0}' would create a dependency cycle")]
    Cycle(String),
}

#[derive(Default)]
struct SandboxState {
    assemblies: HashMap<String, TableAssembly>,
}

impl SandboxState {
    /// Cycle check over the whole dependency graph. Dependencies on
    /// assemblies not (yet) present are ignored; they cannot close a
    /// cycle until they exist.
    fn is_acyclic(&self) -> bool {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for name in self.assemblies.keys() {
            nodes.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for (name, assembly) in &self.assemblies {
            for dep in assembly.dependencies() {
                if let Some(&to) = nodes.get(dep.as_str()) {
                    graph.add_edge(nodes[name.as_str()], to, ());
                }
            }
        }
        !is_cyclic_directed(&graph)
    }
}

/// The lockable assembly set.
#[derive(Default)]
pub struct Sandbox {
    inner: RwLock<SandboxState>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an assembly. Rejected (and rolled back) when
    /// its dependencies would close a cycle.
    pub fn put_assembly(&self, assembly: TableAssembly) -> Result<(), SandboxError> {
        let mut state = self.inner.write().expect("sandbox lock");
        let name = assembly.name.clone();
        let previous = state.assemblies.insert(name.clone(), assembly);
        if !state.is_acyclic() {
            match previous {
                Some(prev) => {
                    state.assemblies.insert(name.clone(), prev);
                }
                None => {
                    state.assemblies.remove(&name);
                }
            }
            return Err(SandboxError::Cycle(name));
        }
        Ok(())
    }

    pub fn remove_assembly(&self, name: &str) -> bool {
        let mut state = self.inner.write().expect("sandbox lock");
        state.assemblies.remove(name).is_some()
    }

    /// Defensive copy of one assembly.
    pub fn assembly(&self, name: &str) -> Option<TableAssembly> {
        let state = self.inner.read().expect("sandbox lock");
        state.assemblies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let state = self.inner.read().expect("sandbox lock");
        state.assemblies.keys().cloned().collect()
    }

    /// Take the read side for the duration of a build. The planner
    /// sees a consistent assembly set until the view drops.
    pub fn view(&self) -> SandboxView<'_> {
        SandboxView {
            guard: self.inner.read().expect("sandbox lock"),
        }
    }
}

/// A read-locked view over the sandbox.
pub struct SandboxView<'a> {
    guard: RwLockReadGuard<'a, SandboxState>,
}

impl SandboxView<'_> {
    pub fn assembly(&self, name: &str) -> Option<TableAssembly> {
        self.guard.assemblies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.guard.assemblies.contains_key(name)
    }
}

impl AssemblyLookup for SandboxView<'_> {
    fn assembly(&self, name: &str) -> Option<TableAssembly> {
        SandboxView::assembly(self, name)
    }
}
