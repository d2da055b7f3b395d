//! Strongly connected components and their condensation
//!
//! Tarjan's algorithm with an explicit stack, so deep dependency chains never
//! exhaust the call stack. Components come out dependencies first when edges
//! point from a dependent to what it depends on.

use crate::ids::{SccId, TypeNodeId};
use serde::{Deserialize, Serialize};

const UNVISITED: usize = usize::MAX;

/// Components of the graph over `0..n`, each emitted after every component it reaches
pub fn tarjan<F, I>(n: usize, mut successors: F) -> Vec<Vec<usize>>
where
    F: FnMut(usize) -> I,
    I: IntoIterator<Item = usize>,
{
    let mut index = vec![UNVISITED; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut next_index = 0usize;

    // (node, successors, next successor position)
    let mut call: Vec<(usize, Vec<usize>, usize)> = Vec::new();

    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        index[root] = next_index;
        lowlink[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;
        call.push((root, successors(root).into_iter().filter(|s| *s < n).collect(), 0));

        while let Some(frame) = call.last_mut() {
            let node = frame.0;
            if frame.2 < frame.1.len() {
                let succ = frame.1[frame.2];
                frame.2 += 1;
                if index[succ] == UNVISITED {
                    index[succ] = next_index;
                    lowlink[succ] = next_index;
                    next_index += 1;
                    stack.push(succ);
                    on_stack[succ] = true;
                    let succs = successors(succ).into_iter().filter(|s| *s < n).collect();
                    call.push((succ, succs, 0));
                } else if on_stack[succ] {
                    lowlink[node] = lowlink[node].min(index[succ]);
                }
                continue;
            }

            call.pop();
            if let Some(parent) = call.last() {
                let parent = parent.0;
                lowlink[parent] = lowlink[parent].min(lowlink[node]);
            }
            if lowlink[node] == index[node] {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                component.sort_unstable();
                components.push(component);
            }
        }
    }
    components
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: SccId,
    pub members: Vec<TypeNodeId>,
    /// More than one member, or a member depending on itself
    pub cyclic: bool,
    /// Components this one depends on
    pub dependencies: Vec<SccId>,
    /// Longest dependency chain below this component
    pub level: usize,
}

/// DAG of components, stored dependencies first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condensation {
    pub components: Vec<Component>,
    scc_of: Vec<SccId>,
}

impl Condensation {
    pub fn build<F, I>(n: usize, mut dependencies: F) -> Self
    where
        F: FnMut(TypeNodeId) -> I,
        I: IntoIterator<Item = TypeNodeId>,
    {
        let deps: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                dependencies(TypeNodeId::from_raw(i as u32))
                    .into_iter()
                    .map(TypeNodeId::index)
                    .collect()
            })
            .collect();
        let raw = tarjan(n, |i| deps[i].clone());

        let mut scc_of = vec![SccId::invalid(); n];
        for (c, members) in raw.iter().enumerate() {
            for &m in members {
                scc_of[m] = SccId::from_raw(c as u32);
            }
        }

        let mut components: Vec<Component> = Vec::with_capacity(raw.len());
        for (c, members) in raw.into_iter().enumerate() {
            let id = SccId::from_raw(c as u32);
            let mut cyclic = members.len() > 1;
            let mut component_deps: Vec<SccId> = Vec::new();
            for &m in &members {
                for &d in &deps[m] {
                    let Some(&target) = scc_of.get(d) else { continue };
                    if target == id {
                        cyclic = true;
                    } else if !component_deps.contains(&target) {
                        component_deps.push(target);
                    }
                }
            }
            // dependencies were emitted earlier, so their levels are final
            let level = component_deps
                .iter()
                .map(|d| components[d.index()].level + 1)
                .max()
                .unwrap_or(0);
            component_deps.sort_unstable();
            components.push(Component {
                id,
                members: members.into_iter().map(|m| TypeNodeId::from_raw(m as u32)).collect(),
                cyclic,
                dependencies: component_deps,
                level,
            });
        }

        Self { components, scc_of }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn scc_of(&self, node: TypeNodeId) -> Option<SccId> {
        self.scc_of.get(node.index()).copied()
    }

    pub fn component(&self, id: SccId) -> Option<&Component> {
        self.components.get(id.index())
    }

    pub fn cyclic_count(&self) -> usize {
        self.components.iter().filter(|c| c.cyclic).count()
    }

    /// Components grouped by level; each wave only depends on earlier waves
    pub fn waves(&self) -> Vec<Vec<SccId>> {
        let depth = self.components.iter().map(|c| c.level + 1).max().unwrap_or(0);
        let mut waves = vec![Vec::new(); depth];
        for c in &self.components {
            waves[c.level].push(c.id);
        }
        waves
    }
}
