pub mod filter;

use std::collections::HashMap;

/// Rank-fusion constant; the conventional value from the RRF paper.
pub const RRF_K: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchType {
    Vector,
    Fts,
    #[default]
    Hybrid,
}

impl SearchType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" => Some(SearchType::Vector),
            "fts" => Some(SearchType::Fts),
            "hybrid" => Some(SearchType::Hybrid),
            _ => None,
        }
    }
}

/// Reciprocal Rank Fusion over two ranked id lists.
/// `score(id) = Σ 1/(k + rank)` over the lists containing it (rank is
/// 1-based). Returns the fused ids with raw RRF scores, descending,
/// truncated to `top_k`.
pub fn reciprocal_rank_fusion(
    vector_ids: &[String],
    fts_ids: &[String],
    k: usize,
    top_k: usize,
) -> Vec<(String, f32)> {
    let mut scores: HashMap<&str, f32> = HashMap::new();
    // First-seen order keeps ties deterministic.
    let mut order: Vec<&str> = Vec::new();

    for list in [vector_ids, fts_ids] {
        for (rank, id) in list.iter().enumerate() {
            let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
            match scores.entry(id.as_str()) {
                std::collections::hash_map::Entry::Occupied(mut e) => *e.get_mut() += rrf,
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(rrf);
                    order.push(id.as_str());
                }
            }
        }
    }

    let mut fused: Vec<(String, f32)> = order
        .into_iter()
        .map(|id| (id.to_string(), scores[id]))
        .collect();
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(top_k);
    fused
}

/// Scale fused RRF scores into [0, 1] by the set maximum. Relative order is
/// preserved; absolute values are not comparable across queries, so callers
/// must not threshold on them.
pub fn normalize_by_max(scores: &mut [(String, f32)]) {
    let max = scores.iter().map(|(_, s)| *s).fold(0.0f32, f32::max);
    if max > 0.0 {
        for (_, s) in scores.iter_mut() {
            *s /= max;
        }
    }
}

/// Min-max scale scores into [0, 1] over the result set (used for FTS
/// scores, which have no intrinsic range). A constant set maps to 1.0.
pub fn min_max_normalize(scores: &mut [f32]) {
    if scores.is_empty() {
        return;
    }
    let max = scores.iter().copied().fold(f32::MIN, f32::max);
    let min = scores.iter().copied().fold(f32::MAX, f32::min);
    let range = max - min;
    for s in scores.iter_mut() {
        *s = if range.abs() < 1e-9 {
            1.0
        } else {
            (*s - min) / range
        };
    }
}

/// Convert an ANN distance into a similarity in (0, 1].
pub fn distance_to_score(distance: f32) -> f32 {
    (1.0 / (1.0 + distance)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rrf_prefers_agreement() {
        let fused = reciprocal_rank_fusion(
            &ids(&["a", "b", "c"]),
            &ids(&["b", "d"]),
            RRF_K,
            10,
        );
        assert_eq!(fused[0].0, "b");
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn rrf_is_monotonic() {
        // a precedes b in both lists, so a must precede b in the fusion.
        let fused = reciprocal_rank_fusion(
            &ids(&["x", "a", "b"]),
            &ids(&["a", "y", "b"]),
            RRF_K,
            10,
        );
        let pos = |id: &str| fused.iter().position(|(i, _)| i == id).unwrap();
        assert!(pos("a") < pos("b"));
    }

    #[test]
    fn normalize_by_max_lands_in_unit_interval() {
        let mut scores = vec![("a".to_string(), 0.032), ("b".to_string(), 0.016)];
        normalize_by_max(&mut scores);
        assert!((scores[0].1 - 1.0).abs() < 1e-6);
        assert!((scores[1].1 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn min_max_handles_constant_sets() {
        let mut scores = vec![3.0, 3.0];
        min_max_normalize(&mut scores);
        assert_eq!(scores, vec![1.0, 1.0]);

        let mut scores = vec![1.0, 3.0, 2.0];
        min_max_normalize(&mut scores);
        assert_eq!(scores, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn distance_zero_is_perfect_score() {
        assert!((distance_to_score(0.0) - 1.0).abs() < 1e-6);
        assert!(distance_to_score(4.0) < 0.25 + 1e-6);
    }
}
