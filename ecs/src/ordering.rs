//! Topological ordering over before/after markers.
//!
//! Shared by the event bus (handler order per event type) and the system
//! manager (update order).

use std::any::TypeId;
use std::collections::{HashMap, VecDeque};

/// One participant in an ordering graph.
pub(crate) struct OrderNode<'a> {
    /// Marker other nodes refer to. Several nodes may share one.
    pub marker: Option<TypeId>,
    pub before: &'a [TypeId],
    pub after: &'a [TypeId],
}

/// Result of a failed sort: indices of the nodes left on a cycle.
#[derive(Debug)]
pub(crate) struct OrderCycle {
    pub members: Vec<usize>,
}

/// Sorts nodes so that every `before`/`after` constraint holds.
///
/// Unconstrained nodes keep their input order (Kahn's algorithm with a FIFO
/// queue seeded in index order). Markers that match no node are ignored;
/// callers that must reject them check beforehand.
pub(crate) fn topological_order(nodes: &[OrderNode<'_>]) -> Result<Vec<usize>, OrderCycle> {
    let n = nodes.len();

    let mut by_marker: HashMap<TypeId, Vec<usize>> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        if let Some(marker) = node.marker {
            by_marker.entry(marker).or_default().push(i);
        }
    }

    // edges[i] contains nodes that must come after node i
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree: Vec<usize> = vec![0; n];
    let mut add_edge = |from: usize, to: usize| {
        if from != to && !edges[from].contains(&to) {
            edges[from].push(to);
            in_degree[to] += 1;
        }
    };

    for (i, node) in nodes.iter().enumerate() {
        for marker in node.before {
            for &j in by_marker.get(marker).into_iter().flatten() {
                add_edge(i, j);
            }
        }
        for marker in node.after {
            for &j in by_marker.get(marker).into_iter().flatten() {
                add_edge(j, i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        for &next in &edges[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err(OrderCycle {
            members: (0..n).filter(|&i| in_degree[i] > 0).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;
    struct C;

    fn id<T: 'static>() -> TypeId {
        TypeId::of::<T>()
    }

    #[test]
    fn unconstrained_nodes_keep_input_order() {
        let nodes = [
            OrderNode { marker: Some(id::<A>()), before: &[], after: &[] },
            OrderNode { marker: Some(id::<B>()), before: &[], after: &[] },
            OrderNode { marker: None, before: &[], after: &[] },
        ];
        assert_eq!(topological_order(&nodes).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn before_and_after_are_respected() {
        let before_a = [id::<A>()];
        let after_a = [id::<A>()];
        let nodes = [
            OrderNode { marker: Some(id::<A>()), before: &[], after: &[] },
            OrderNode { marker: Some(id::<B>()), before: &[], after: &after_a },
            OrderNode { marker: Some(id::<C>()), before: &before_a, after: &[] },
        ];
        assert_eq!(topological_order(&nodes).unwrap(), vec![2, 0, 1]);
    }

    #[test]
    fn unknown_markers_are_ignored() {
        let before_c = [id::<C>()];
        let nodes = [
            OrderNode { marker: Some(id::<A>()), before: &before_c, after: &[] },
            OrderNode { marker: Some(id::<B>()), before: &[], after: &[] },
        ];
        assert_eq!(topological_order(&nodes).unwrap(), vec![0, 1]);
    }

    #[test]
    fn cycle_reports_members() {
        let before_a = [id::<A>()];
        let before_b = [id::<B>()];
        let nodes = [
            OrderNode { marker: Some(id::<A>()), before: &before_b, after: &[] },
            OrderNode { marker: Some(id::<B>()), before: &before_a, after: &[] },
            OrderNode { marker: Some(id::<C>()), before: &[], after: &[] },
        ];
        let cycle = topological_order(&nodes).unwrap_err();
        assert_eq!(cycle.members, vec![0, 1]);
    }
}
