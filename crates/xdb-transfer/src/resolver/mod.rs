//! Foreign-key dependency ordering.
//!
//! Tables are ordered so that every table comes after the tables it
//! references (creation/load order); the reverse is the safe deletion order.
//! Ordering is Kahn's algorithm with a sorted ready set, so independent tables
//! come out by full name. Self-references are always deferred. When the sort
//! stalls on a cycle, the strongly connected components of what is left are
//! computed and one in-cycle foreign key is deferred, then sorting resumes.
//! The key deferred belongs to the stalled table with the fewest unmet
//! references, ties broken by table and constraint name, so a table that
//! references its cycle partner twice is not deferred twice when the
//! partner's single reference back would break the cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::schema::{ForeignKey, Table};

/// Why a foreign key was taken out of the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    SelfReference,
    Cycle,
    /// The referenced table is not part of the set being ordered.
    External,
}

/// A foreign key to apply only after every table in the run exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredConstraint {
    /// Full name of the owning (referencing) table.
    pub table: String,
    pub foreign_key: ForeignKey,
    pub reason: DeferReason,
}

/// A raw FK edge, as written to `dependencies.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Referencing table.
    pub from: String,
    /// Referenced table.
    pub to: String,
    pub constraint: String,
}

/// Result of dependency resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOrder {
    /// Creation / load order.
    pub order: Vec<String>,
    pub deferred: Vec<DeferredConstraint>,
    /// FKs whose referenced table is not part of the set.
    pub external: Vec<DeferredConstraint>,
}

impl ResolvedOrder {
    /// Safe deletion / truncation order.
    pub fn deletion_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    pub fn is_deferred(&self, table: &str, fk_name: &str) -> bool {
        self.deferred
            .iter()
            .any(|d| d.table == table && d.foreign_key.name == fk_name)
    }

    pub fn position(&self, table: &str) -> Option<usize> {
        self.order.iter().position(|t| t == table)
    }
}

/// All FK edges among `tables`, including self-references and external ones.
pub fn dependency_edges(tables: &[Table]) -> Vec<DependencyEdge> {
    let mut edges: Vec<DependencyEdge> = tables
        .iter()
        .flat_map(|t| {
            let from = t.full_name();
            t.foreign_keys.iter().map(move |fk| DependencyEdge {
                from: from.clone(),
                to: fk.ref_full_name(),
                constraint: fk.name.clone(),
            })
        })
        .collect();
    edges.sort_by(|a, b| (&a.from, &a.constraint).cmp(&(&b.from, &b.constraint)));
    edges
}

struct Edge {
    from: String,
    to: String,
    fk: ForeignKey,
    active: bool,
    satisfied: bool,
}

/// Transient FK graph over one set of tables.
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    edges: Vec<Edge>,
    deferred: Vec<DeferredConstraint>,
    external: Vec<DeferredConstraint>,
}

impl DependencyGraph {
    pub fn build(tables: &[Table]) -> Self {
        let nodes: BTreeSet<String> = tables.iter().map(|t| t.full_name()).collect();
        let mut edges = Vec::new();
        let mut deferred = Vec::new();
        let mut external = Vec::new();

        for table in tables {
            let from = table.full_name();
            for fk in &table.foreign_keys {
                let to = fk.ref_full_name();
                if to == from {
                    deferred.push(DeferredConstraint {
                        table: from.clone(),
                        foreign_key: fk.clone(),
                        reason: DeferReason::SelfReference,
                    });
                } else if !nodes.contains(&to) {
                    external.push(DeferredConstraint {
                        table: from.clone(),
                        foreign_key: fk.clone(),
                        reason: DeferReason::External,
                    });
                } else {
                    edges.push(Edge {
                        from: from.clone(),
                        to,
                        fk: fk.clone(),
                        active: true,
                        satisfied: false,
                    });
                }
            }
        }

        Self {
            nodes,
            edges,
            deferred,
            external,
        }
    }

    /// Produce the ordering, consuming the graph.
    pub fn resolve(mut self) -> ResolvedOrder {
        let mut pending: HashMap<String, usize> = self.nodes.iter().map(|n| (n.clone(), 0)).collect();
        for edge in &self.edges {
            if let Some(count) = pending.get_mut(&edge.from) {
                *count += 1;
            }
        }

        let mut ready: BTreeSet<String> = pending
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(n, _)| n.clone())
            .collect();
        let mut done: BTreeSet<String> = BTreeSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        while done.len() < self.nodes.len() {
            if let Some(next) = ready.pop_first() {
                for edge in self.edges.iter_mut() {
                    if edge.active && !edge.satisfied && edge.to == next {
                        edge.satisfied = true;
                        if let Some(count) = pending.get_mut(&edge.from) {
                            *count -= 1;
                            if *count == 0 && !done.contains(&edge.from) {
                                ready.insert(edge.from.clone());
                            }
                        }
                    }
                }
                done.insert(next.clone());
                order.push(next);
                continue;
            }

            // Stalled: everything left sits on or behind a cycle
            let Some(idx) = self.pick_cycle_edge(&done, &pending) else {
                break;
            };
            let edge = &mut self.edges[idx];
            edge.active = false;
            debug!(
                "Deferring {} ({} -> {}) to break a dependency cycle",
                edge.fk.name, edge.from, edge.to
            );
            self.deferred.push(DeferredConstraint {
                table: edge.from.clone(),
                foreign_key: edge.fk.clone(),
                reason: DeferReason::Cycle,
            });
            if let Some(count) = pending.get_mut(&edge.from) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(edge.from.clone());
                }
            }
        }

        self.deferred
            .sort_by(|a, b| (&a.table, &a.foreign_key.name).cmp(&(&b.table, &b.foreign_key.name)));
        self.external
            .sort_by(|a, b| (&a.table, &a.foreign_key.name).cmp(&(&b.table, &b.foreign_key.name)));
        ResolvedOrder {
            order,
            deferred: self.deferred,
            external: self.external,
        }
    }

    /// Index of the open in-cycle edge with the smallest
    /// (owner's unmet references, owner, fk name).
    fn pick_cycle_edge(&self, done: &BTreeSet<String>, pending: &HashMap<String, usize>) -> Option<usize> {
        let mut graph: DiGraph<&str, usize> = DiGraph::new();
        let mut index: BTreeMap<&str, NodeIndex> = BTreeMap::new();
        for node in self.nodes.iter().filter(|n| !done.contains(*n)) {
            index.insert(node.as_str(), graph.add_node(node.as_str()));
        }
        for (i, edge) in self.edges.iter().enumerate() {
            if !edge.active || edge.satisfied {
                continue;
            }
            if let (Some(a), Some(b)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) {
                graph.add_edge(*a, *b, i);
            }
        }

        let mut component_of: HashMap<NodeIndex, usize> = HashMap::new();
        for (c, scc) in tarjan_scc(&graph).into_iter().enumerate() {
            if scc.len() > 1 {
                for n in scc {
                    component_of.insert(n, c);
                }
            }
        }

        let key = |i: usize| {
            let edge = &self.edges[i];
            (
                pending.get(&edge.from).copied().unwrap_or(0),
                edge.from.as_str(),
                edge.fk.name.as_str(),
                edge.to.as_str(),
            )
        };
        let in_cycle = graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = graph.edge_endpoints(e)?;
                match (component_of.get(&a), component_of.get(&b)) {
                    (Some(x), Some(y)) if x == y => Some(graph[e]),
                    _ => None,
                }
            })
            .min_by(|x, y| key(*x).cmp(&key(*y)));

        in_cycle.or_else(|| graph.edge_indices().map(|e| graph[e]).min_by(|x, y| key(*x).cmp(&key(*y))))
    }
}

/// Resolve the creation order for `tables`.
pub fn resolve(tables: &[Table]) -> ResolvedOrder {
    DependencyGraph::build(tables).resolve()
}
