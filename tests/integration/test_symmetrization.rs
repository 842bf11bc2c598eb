//! Fuzzy-union symmetrization does not depend on the order lists are built in.

use corpus_atlas::ChunkId;
use corpus_atlas::graph::{NeighborGraph, combine};

fn id(n: u32) -> ChunkId {
    ChunkId::new(n).unwrap()
}

/// Directed lists of a small asymmetric neighborhood.
fn lists() -> Vec<(ChunkId, Vec<(ChunkId, f32)>)> {
    vec![
        (id(1), vec![(id(2), 0.10), (id(3), 0.40), (id(4), 0.90)]),
        (id(2), vec![(id(1), 0.10), (id(4), 0.30)]),
        (id(3), vec![(id(4), 0.20), (id(1), 0.40), (id(2), 0.70)]),
        (id(4), vec![(id(3), 0.20)]),
    ]
}

#[test]
fn test_union_is_independent_of_insertion_order() {
    let mut forward = NeighborGraph::new(1.0);
    for (owner, raw) in lists() {
        forward.set_neighbors(owner, &raw);
    }

    let mut backward = NeighborGraph::new(1.0);
    for (owner, raw) in lists().into_iter().rev() {
        backward.set_neighbors(owner, &raw);
    }

    let a = forward.symmetric_edges();
    let b = backward.symmetric_edges();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!((x.a, x.b), (y.a, y.b));
        assert!((x.weight - y.weight).abs() < 1e-7);
    }
}

#[test]
fn test_edge_weight_is_probabilistic_union() {
    let mut graph = NeighborGraph::new(1.0);
    for (owner, raw) in lists() {
        graph.set_neighbors(owner, &raw);
    }

    for edge in graph.symmetric_edges() {
        let w1 = graph.directed_weight(edge.a, edge.b);
        let w2 = graph.directed_weight(edge.b, edge.a);
        let expected = w1 + w2 - w1 * w2;
        assert!((edge.weight - expected).abs() < 1e-6);
        assert_eq!(graph.edge_weight(edge.a, edge.b), graph.edge_weight(edge.b, edge.a));
        assert!(edge.weight <= 1.0);
    }

    // 1 lists 4 but 4 does not list 1; the union keeps the one-sided edge
    assert_eq!(graph.directed_weight(id(4), id(1)), 0.0);
    assert!(graph.edge_weight(id(1), id(4)) > 0.0);
}

#[test]
fn test_combine_is_commutative() {
    for &(w1, w2) in &[(0.0, 0.3), (0.2, 0.9), (1.0, 0.5), (0.7, 0.7)] {
        for mix in [0.0, 0.25, 1.0] {
            assert_eq!(combine(w1, w2, mix), combine(w2, w1, mix));
        }
    }
}
