//! Reciprocal Rank Fusion (RRF) for combining search results.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use ragfuse_core::{Candidate, FusedResult};

/// RRF constant (commonly 60).
/// Higher values flatten the gap between top and lower ranks.
pub const DEFAULT_RRF_K: u32 = 60;

/// Tunables for a single fusion pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RrfParams {
    /// Smoothing constant added to every rank.
    pub rrf_k: u32,

    /// Weight of the keyword ranking; the vector ranking gets `1 - keyword_weight`.
    pub keyword_weight: f32,
}

impl Default for RrfParams {
    fn default() -> Self {
        Self {
            rrf_k: DEFAULT_RRF_K,
            keyword_weight: 0.3,
        }
    }
}

/// Order candidates by score descending, ties by ascending id, and number them 1..n.
///
/// The first occurrence of an id wins; later duplicates are dropped.
pub fn assign_ranks(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    let mut seen = HashSet::with_capacity(candidates.len());
    candidates.retain(|c| seen.insert(c.chunk_id));

    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = i as u32 + 1;
    }

    candidates
}

/// Fuse a vector ranking and a keyword ranking using weighted RRF.
///
/// combined = (1 - w) / (k + rank_vector) + w / (k + rank_keyword)
///
/// An item missing from one list takes the penalty rank `2 * len(that list) + 1`
/// there and reports a 0.0 score for that source. Both inputs must already be
/// rank-assigned (see [`assign_ranks`]).
///
/// # Returns
/// At most `limit` results sorted by combined score descending, ties by ascending id.
pub fn reciprocal_rank_fusion(
    vector: &[Candidate],
    keyword: &[Candidate],
    params: RrfParams,
    limit: usize,
) -> Vec<FusedResult> {
    let k = params.rrf_k as f64;
    let keyword_weight = params.keyword_weight as f64;
    let vector_weight = 1.0 - keyword_weight;

    let vector_penalty = (vector.len() * 2 + 1) as f64;
    let keyword_penalty = (keyword.len() * 2 + 1) as f64;

    let keyword_by_id: HashMap<Ulid, &Candidate> =
        keyword.iter().map(|c| (c.chunk_id, c)).collect();

    let mut fused: Vec<FusedResult> = Vec::with_capacity(vector.len() + keyword.len());

    for v in vector {
        let matched = keyword_by_id.get(&v.chunk_id);
        let keyword_rank = matched.map_or(keyword_penalty, |c| c.rank as f64);

        fused.push(FusedResult {
            id: v.chunk_id,
            document_id: v.document_id,
            content: v.content.clone(),
            metadata: v.metadata.clone(),
            vector_score: v.score,
            keyword_score: matched.map_or(0.0, |c| c.score),
            combined_score: vector_weight / (k + v.rank as f64)
                + keyword_weight / (k + keyword_rank),
        });
    }

    let vector_ids: HashSet<Ulid> = vector.iter().map(|c| c.chunk_id).collect();

    for kw in keyword.iter().filter(|c| !vector_ids.contains(&c.chunk_id)) {
        fused.push(FusedResult {
            id: kw.chunk_id,
            document_id: kw.document_id,
            content: kw.content.clone(),
            metadata: kw.metadata.clone(),
            vector_score: 0.0,
            keyword_score: kw.score,
            combined_score: vector_weight / (k + vector_penalty)
                + keyword_weight / (k + kw.rank as f64),
        });
    }

    fused.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused.truncate(limit);

    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragfuse_core::Metadata;

    fn id(n: u128) -> Ulid {
        Ulid::from(n)
    }

    fn candidate(n: u128, score: f32) -> Candidate {
        Candidate {
            chunk_id: id(n),
            document_id: id(1000),
            content: format!("chunk {}", n),
            metadata: Metadata::new(),
            score,
            rank: 0,
        }
    }

    fn ranked(items: &[(u128, f32)]) -> Vec<Candidate> {
        assign_ranks(items.iter().map(|&(n, s)| candidate(n, s)).collect())
    }

    fn ids(results: &[FusedResult]) -> Vec<Ulid> {
        results.iter().map(|r| r.id).collect()
    }

    const A: u128 = 1;
    const B: u128 = 2;
    const C: u128 = 3;

    #[test]
    fn test_assign_ranks_orders_and_dedups() {
        let ranks = assign_ranks(vec![
            candidate(3, 0.5),
            candidate(1, 0.9),
            candidate(2, 0.5),
            candidate(1, 0.1),
        ]);

        let order: Vec<(Ulid, u32)> = ranks.iter().map(|c| (c.chunk_id, c.rank)).collect();
        assert_eq!(order, vec![(id(1), 1), (id(2), 2), (id(3), 3)]);
        assert_eq!(ranks[0].score, 0.9);
    }

    #[test]
    fn test_weighted_rrf_example() {
        let vector = ranked(&[(A, 0.9), (B, 0.8), (C, 0.7)]);
        let keyword = ranked(&[(B, 12.0), (C, 7.0)]);

        let fused = reciprocal_rank_fusion(
            &vector,
            &keyword,
            RrfParams {
                rrf_k: 60,
                keyword_weight: 0.3,
            },
            10,
        );

        assert_eq!(ids(&fused), vec![id(B), id(A), id(C)]);

        let score = |n: u128| fused.iter().find(|r| r.id == id(n)).unwrap().combined_score;
        assert!((score(A) - (0.7 / 61.0 + 0.3 / 65.0)).abs() < 1e-9);
        assert!((score(B) - (0.7 / 62.0 + 0.3 / 61.0)).abs() < 1e-9);
        assert!((score(C) - (0.7 / 63.0 + 0.3 / 62.0)).abs() < 1e-9);
        assert!((score(A) - 0.01610).abs() < 1e-5);
        assert!((score(B) - 0.01620).abs() < 1e-5);
        assert!((score(C) - 0.01595).abs() < 1e-5);

        let a = &fused[1];
        assert_eq!(a.keyword_score, 0.0);
        assert_eq!(a.vector_score, 0.9);
    }

    #[test]
    fn test_empty_keyword_list_keeps_vector_order() {
        let vector = ranked(&[(A, 0.9), (B, 0.8), (C, 0.7)]);

        let fused = reciprocal_rank_fusion(&vector, &[], RrfParams::default(), 10);

        assert_eq!(ids(&fused), vec![id(A), id(B), id(C)]);
        assert!(fused.iter().all(|r| r.keyword_score == 0.0));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(reciprocal_rank_fusion(&[], &[], RrfParams::default(), 10).is_empty());
    }

    #[test]
    fn test_weight_boundaries() {
        let vector = ranked(&[(A, 0.9), (B, 0.8), (C, 0.7)]);
        let keyword = ranked(&[(C, 9.0), (4, 8.0), (B, 7.0)]);

        let vector_only = reciprocal_rank_fusion(
            &vector,
            &keyword,
            RrfParams {
                rrf_k: 60,
                keyword_weight: 0.0,
            },
            10,
        );
        // Keyword-only item 4 sits at the vector penalty rank, after every vector item
        assert_eq!(ids(&vector_only), vec![id(A), id(B), id(C), id(4)]);

        let keyword_only = reciprocal_rank_fusion(
            &vector,
            &keyword,
            RrfParams {
                rrf_k: 60,
                keyword_weight: 1.0,
            },
            10,
        );
        assert_eq!(ids(&keyword_only), vec![id(C), id(4), id(B), id(A)]);
    }

    #[test]
    fn test_presence_in_both_lists_beats_single_list() {
        let vector = ranked(&[(A, 0.9), (B, 0.8)]);
        let score_of_b = |keyword: &[Candidate]| {
            reciprocal_rank_fusion(&vector, keyword, RrfParams::default(), 10)
                .into_iter()
                .find(|r| r.id == id(B))
                .unwrap()
                .combined_score
        };

        // B at the last keyword rank still beats B at the penalty rank
        let with_b = ranked(&[(C, 5.0), (4, 4.0), (B, 3.0)]);
        let without_b = ranked(&[(C, 5.0), (4, 4.0), (5, 3.0)]);
        assert!(score_of_b(&with_b) > score_of_b(&without_b));
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let vector = ranked(&[(7, 0.9)]);
        let keyword = ranked(&[(5, 4.0)]);

        // Equal weights give identical combined scores
        let fused = reciprocal_rank_fusion(
            &vector,
            &keyword,
            RrfParams {
                rrf_k: 60,
                keyword_weight: 0.5,
            },
            10,
        );

        assert_eq!(fused[0].combined_score, fused[1].combined_score);
        assert_eq!(ids(&fused), vec![id(5), id(7)]);
    }

    #[test]
    fn test_truncation_and_determinism() {
        let vector = ranked(&[(A, 0.9), (B, 0.8), (C, 0.7), (4, 0.6), (5, 0.5)]);
        let keyword = ranked(&[(5, 2.0), (C, 1.0)]);

        let first = reciprocal_rank_fusion(&vector, &keyword, RrfParams::default(), 3);
        let second = reciprocal_rank_fusion(&vector, &keyword, RrfParams::default(), 3);

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }
}
