//! Step dependency graph over plan indices.
//!
//! The graph is an adjacency list keyed by step index, never by reference, so
//! a cyclic plan is just data to inspect.

use std::collections::HashMap;

use crate::core::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Edges point from a step to the steps it depends on.
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    ids: Vec<&'a str>,
    edges: Vec<Vec<usize>>,
}

impl<'a> DependencyGraph<'a> {
    /// Build the graph. Unknown dependency ids are dropped here; the gate
    /// reports them separately. Duplicate ids resolve to their first occurrence.
    pub fn from_plan(plan: &'a Plan) -> Self {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (position, step) in plan.steps.iter().enumerate() {
            index.entry(step.id.as_str()).or_insert(position);
        }
        let ids = plan.steps.iter().map(|step| step.id.as_str()).collect();
        let edges = plan
            .steps
            .iter()
            .map(|step| {
                step.depends_on
                    .iter()
                    .filter_map(|dep| index.get(dep.as_str()).copied())
                    .collect()
            })
            .collect();
        Self { ids, edges }
    }

    pub fn id(&self, index: usize) -> &'a str {
        self.ids[index]
    }

    /// Back-edges found by depth-first white/gray/black coloring.
    ///
    /// Traversal is iterative and visits roots and neighbours in index order,
    /// so the result is deterministic and deep plans cannot overflow the stack.
    pub fn back_edges(&self) -> Vec<(usize, usize)> {
        let mut color = vec![Color::White; self.edges.len()];
        let mut back = Vec::new();

        for root in 0..self.edges.len() {
            if color[root] != Color::White {
                continue;
            }
            color[root] = Color::Gray;
            let mut stack = vec![(root, 0usize)];
            while let Some(frame) = stack.last_mut() {
                let (node, cursor) = *frame;
                if cursor < self.edges[node].len() {
                    frame.1 += 1;
                    let target = self.edges[node][cursor];
                    match color[target] {
                        Color::White => {
                            color[target] = Color::Gray;
                            stack.push((target, 0));
                        }
                        Color::Gray => back.push((node, target)),
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    stack.pop();
                }
            }
        }

        back
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::StepType;
    use crate::test_support::{plan, step_after};

    #[test]
    fn acyclic_chain_has_no_back_edges() {
        let plan = plan(vec![
            step_after("a", StepType::ReadFile, &[]),
            step_after("b", StepType::ReadFile, &["a"]),
            step_after("c", StepType::ReadFile, &["a", "b"]),
        ]);
        assert!(DependencyGraph::from_plan(&plan).back_edges().is_empty());
    }

    #[test]
    fn two_step_cycle_is_found() {
        let plan = plan(vec![
            step_after("a", StepType::ApplyPatch, &["b"]),
            step_after("b", StepType::RunTests, &["a"]),
        ]);
        let graph = DependencyGraph::from_plan(&plan);
        let back = graph.back_edges();
        assert_eq!(back, vec![(1, 0)]);
        assert_eq!(graph.id(1), "b");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plan = plan(vec![step_after("a", StepType::Wait, &["a"])]);
        assert_eq!(DependencyGraph::from_plan(&plan).back_edges(), vec![(0, 0)]);
    }

    #[test]
    fn long_chain_does_not_recurse() {
        let ids: Vec<String> = (0..10_000).map(|n| format!("s{n}")).collect();
        let steps = ids
            .iter()
            .enumerate()
            .map(|(n, id)| {
                let deps: Vec<&str> = if n + 1 < ids.len() {
                    vec![ids[n + 1].as_str()]
                } else {
                    Vec::new()
                };
                step_after(id, StepType::ReadFile, &deps)
            })
            .collect();
        let plan = plan(steps);
        assert!(DependencyGraph::from_plan(&plan).back_edges().is_empty());
    }
}
