//! Structural properties that must hold for any corpus.

use std::collections::BTreeSet;

use corpus_atlas::{ChunkId, ChunkState, Corpus, NewChunk};

use crate::common::{chunks_for, clustered_vectors, create_test_corpus, distance, inline_config};

fn assert_referential_integrity(corpus: &Corpus) {
    let state = corpus.read();
    let stored: BTreeSet<ChunkId> = state.store().list_all().map(|r| r.id).collect();
    let placed: BTreeSet<ChunkId> = state.layout().ids().collect();
    let linked: BTreeSet<ChunkId> = state.graph().ids().collect();

    assert_eq!(stored, placed, "layout and store disagree");
    assert_eq!(stored, linked, "graph and store disagree");
    for id in &stored {
        for neighbor in state.graph().neighbors(*id).unwrap() {
            assert!(
                stored.contains(&neighbor.id),
                "{id} lists missing chunk {}",
                neighbor.id
            );
        }
    }
}

#[test]
fn test_referential_integrity_through_inserts_overwrites_and_removals() {
    let (corpus, _dir) = create_test_corpus(inline_config());
    let vectors = clustered_vectors(40, 16, 4, 7);
    let report = corpus.insert_batch(chunks_for("doc", &vectors)).unwrap();
    assert_eq!(report.ingested.len(), 40);
    assert_referential_integrity(&corpus);

    // Overwrite a few chunks with new embeddings
    let replacements = clustered_vectors(5, 16, 1, 99);
    for (i, v) in replacements.into_iter().enumerate() {
        let outcome = corpus
            .insert(NewChunk::new("doc", i as u32 * 3, "rewritten", v))
            .unwrap();
        assert!(outcome.replaced);
    }
    assert_referential_integrity(&corpus);

    for id in report.ingested.iter().step_by(4) {
        corpus.remove(*id).unwrap();
    }
    assert_referential_integrity(&corpus);
    assert_eq!(corpus.read().len(), 30);

    corpus.settle_now().unwrap();
    assert_referential_integrity(&corpus);
}

#[test]
fn test_neighbor_lists_are_calibrated() {
    let mut config = inline_config();
    config.graph.n_neighbors = 6;
    let (corpus, _dir) = create_test_corpus(config);
    corpus
        .insert_batch(chunks_for("doc", &clustered_vectors(30, 12, 3, 11)))
        .unwrap();

    let state = corpus.read();
    for record in state.store().list_all() {
        let list = state.graph().neighbors(record.id).unwrap();
        assert_eq!(list.len(), 6);
        assert!((list[0].weight - 1.0).abs() < 1e-6, "nearest must have weight 1");
        for pair in list.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
            assert!(pair[0].weight >= pair[1].weight);
        }
        assert!(list.iter().all(|n| n.weight > 0.0 && n.weight <= 1.0));
        assert!(list.iter().all(|n| n.id != record.id));
    }
}

#[test]
fn test_small_corpus_links_all_other_points() {
    let (corpus, _dir) = create_test_corpus(inline_config());
    let single = corpus
        .insert(NewChunk::new("doc", 0, "alone", vec![1.0, 0.0, 0.0]))
        .unwrap();
    assert_eq!(single.neighbors, 0);
    assert!(corpus.read().graph().neighbors(single.id).unwrap().is_empty());
    assert!(corpus.read().layout().get(single.id).is_some());

    corpus
        .insert(NewChunk::new("doc", 1, "second", vec![0.0, 1.0, 0.0]))
        .unwrap();
    corpus
        .insert(NewChunk::new("doc", 2, "third", vec![0.0, 0.0, 1.0]))
        .unwrap();

    let state = corpus.read();
    for record in state.store().list_all() {
        assert_eq!(state.graph().neighbors(record.id).unwrap().len(), 2);
    }
}

#[test]
fn test_self_similarity_scores_one() {
    let (corpus, _dir) = create_test_corpus(inline_config());
    let vectors = clustered_vectors(25, 8, 5, 3);
    let report = corpus.insert_batch(chunks_for("doc", &vectors)).unwrap();

    for (id, v) in report.ingested.iter().zip(&vectors) {
        let hits = corpus.search(v, 1).unwrap();
        assert_eq!(hits[0].id, *id);
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[0].score.get(), 1.0);
    }
}

#[test]
fn test_settled_points_stay_within_containment_bound() {
    let config = inline_config();
    let bound = config.settle.containment_bound;
    let (corpus, _dir) = create_test_corpus(config);
    let vectors = clustered_vectors(60, 16, 3, 21);
    let (initial, late) = vectors.split_at(40);

    corpus.insert_batch(chunks_for("early", initial)).unwrap();
    corpus.settle_now().unwrap();

    corpus.insert_batch(chunks_for("late", late)).unwrap();

    let state = corpus.read();
    let mut settled = 0;
    for (id, placement) in state.layout().iter() {
        if placement.state != ChunkState::Settled {
            continue;
        }
        settled += 1;
        let anchor = placement.settled.as_ref().unwrap();
        let moved = distance(&placement.coords, anchor);
        assert!(moved <= bound + 1e-4, "{id} moved {moved} > {bound}");
    }
    assert_eq!(settled, 40);
}

#[test]
fn test_states_only_move_forward() {
    let (corpus, _dir) = create_test_corpus(inline_config());
    let vectors = clustered_vectors(20, 8, 2, 5);
    let report = corpus.insert_batch(chunks_for("a", &vectors[..10])).unwrap();
    corpus.settle_now().unwrap();
    corpus.insert_batch(chunks_for("b", &vectors[10..])).unwrap();

    let state = corpus.read();
    for id in &report.ingested {
        assert_eq!(state.layout().get(*id).unwrap().state, ChunkState::Settled);
    }
    assert_eq!(
        state
            .layout()
            .iter()
            .filter(|(_, p)| p.state == ChunkState::LocallyPlaced)
            .count(),
        10
    );
}

#[test]
fn test_identical_inputs_give_identical_layouts() {
    let vectors = clustered_vectors(30, 10, 3, 42);
    let run = || {
        let (corpus, dir) = create_test_corpus(inline_config());
        corpus.insert_batch(chunks_for("doc", &vectors)).unwrap();
        corpus.settle_now().unwrap();
        let points = corpus.points();
        drop(corpus);
        drop(dir);
        points
    };

    let first = run();
    let second = run();
    assert_eq!(first.len(), 30);
    assert_eq!(first, second);
}

#[test]
fn test_approximate_index_above_threshold() {
    let mut config = inline_config();
    config.graph.approximate_threshold = 50;
    let (corpus, _dir) = create_test_corpus(config);
    let vectors = clustered_vectors(120, 16, 4, 8);
    let report = corpus.insert_batch(chunks_for("doc", &vectors)).unwrap();
    assert!(report.is_clean());
    assert_referential_integrity(&corpus);

    // Exact duplicates of stored chunks are found through the buckets too
    for (id, v) in report.ingested.iter().zip(&vectors).step_by(10) {
        let hits = corpus.search(v, 3).unwrap();
        assert_eq!(hits[0].id, *id);
    }
}
