//! Sweep-group scheduling.
//!
//! Cross-zone references (through the compartments' wrapper maps) form a
//! directed graph over the zones being collected. Zones in one strongly
//! connected component must be swept in the same slice; across components,
//! a zone is swept only after every zone it references has been swept, so
//! that no finalizer can run while an unswept zone still holds an edge to a
//! dead cell it might observe.
//!
//! Tarjan's algorithm emits components in exactly that order (each component
//! before every component that references it), so the emission order is the
//! sweep order.

use std::collections::HashMap;
use std::sync::Arc;

use super::Zone;

/// Compute strongly connected components of a graph over nodes `0..n`.
/// Components are returned in reverse topological order: a component appears
/// before any component with an edge into it.
pub(crate) fn tarjan_scc(n: usize, edges: &[(usize, usize)]) -> Vec<Vec<usize>> {
    let mut adjacency = vec![Vec::new(); n];
    for &(from, to) in edges {
        debug_assert!(from < n && to < n);
        if from != to {
            adjacency[from].push(to);
        }
    }

    const UNVISITED: usize = usize::MAX;
    let mut index = vec![UNVISITED; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut next_index = 0usize;

    // The usual recursive formulation, made iterative with an explicit work
    // stack of (node, next-child-offset) frames so a long zone chain cannot
    // overflow the thread stack.
    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        let mut work: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some(&(node, child)) = work.last() {
            if child == 0 {
                index[node] = next_index;
                lowlink[node] = next_index;
                next_index += 1;
                stack.push(node);
                on_stack[node] = true;
            }
            if child < adjacency[node].len() {
                let target = adjacency[node][child];
                work.last_mut().unwrap().1 += 1;
                if index[target] == UNVISITED {
                    work.push((target, 0));
                } else if on_stack[target] {
                    lowlink[node] = lowlink[node].min(index[target]);
                }
            } else {
                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[node]);
                }
                if lowlink[node] == index[node] {
                    let mut component = Vec::new();
                    loop {
                        let member = stack.pop().unwrap();
                        on_stack[member] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
    }
    components
}

/// Partition the zones being collected into sweep groups, in sweep order.
/// Also records each zone's group index for the driver's resume state.
pub fn compute_sweep_groups(zones: &[Arc<Zone>]) -> Vec<Vec<Arc<Zone>>> {
    let node_of: HashMap<usize, usize> = zones
        .iter()
        .enumerate()
        .map(|(i, z)| (z.id(), i))
        .collect();

    let mut edges: Vec<(usize, usize)> = Vec::new();
    for (from, zone) in zones.iter().enumerate() {
        for compartment in zone.compartments() {
            for (target, _wrapper) in compartment.wrapper_entries() {
                if target.is_nursery() {
                    continue;
                }
                let target_zone = target.zone();
                if target_zone.id() == zone.id() {
                    continue;
                }
                if let Some(&to) = node_of.get(&target_zone.id()) {
                    edges.push((from, to));
                }
            }
        }
    }

    let components = tarjan_scc(zones.len(), &edges);
    let groups: Vec<Vec<Arc<Zone>>> = components
        .into_iter()
        .map(|members| members.into_iter().map(|i| zones[i].clone()).collect())
        .collect();

    for (group_index, group) in groups.iter().enumerate() {
        for zone in group {
            zone.set_sweep_group_index(group_index);
        }
    }
    debug!(
        "sweep groups: {:?}",
        groups
            .iter()
            .map(|g| g.iter().map(|z| z.id()).collect::<Vec<_>>())
            .collect::<Vec<_>>()
    );
    groups
}

#[cfg(test)]
mod tests {
    use super::tarjan_scc;

    fn sorted(mut components: Vec<Vec<usize>>) -> Vec<Vec<usize>> {
        for c in &mut components {
            c.sort_unstable();
        }
        components
    }

    #[test]
    fn singletons_without_edges() {
        let components = tarjan_scc(3, &[]);
        assert_eq!(components.len(), 3);
    }

    #[test]
    fn chain_is_swept_targets_first() {
        // 0 -> 1 -> 2: zone 2 is referenced by 1, which is referenced by 0.
        // Sweep order must be 2, 1, 0.
        let components = sorted(tarjan_scc(3, &[(0, 1), (1, 2)]));
        assert_eq!(components, vec![vec![2], vec![1], vec![0]]);
    }

    #[test]
    fn cycle_collapses_to_one_group() {
        let components = sorted(tarjan_scc(3, &[(0, 1), (1, 0), (1, 2)]));
        assert_eq!(components, vec![vec![2], vec![0, 1]]);
    }

    #[test]
    fn diamond() {
        // 0 -> {1, 2} -> 3
        let components = sorted(tarjan_scc(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]));
        assert_eq!(components[0], vec![3]);
        assert_eq!(*components.last().unwrap(), vec![0]);
    }

    #[test]
    fn self_edges_are_ignored() {
        let components = tarjan_scc(2, &[(0, 0), (0, 1)]);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec![1]);
    }
}
