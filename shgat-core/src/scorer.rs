//! K-head scoring of propagated capability embeddings against an intent

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::forward::ForwardPass;
use crate::graph::GraphStore;
use crate::math::sigmoid;
use crate::params::NetworkParams;

/// Reported score ceiling
pub const SCORE_CEILING: f32 = 0.95;

/// One ranked capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreItem {
    pub capability_id: String,
    pub score: f32,
    pub per_head_scores: Vec<f32>,
    pub hierarchy_level: usize,
}

/// Per-head scoring intermediates for one capability, kept for the trainer
#[derive(Debug, Clone)]
pub struct HeadScores {
    /// `[head]` query projections of the intent
    pub queries: Vec<DVector<f32>>,
    /// `[head]` key projections of the capability embedding
    pub keys: Vec<DVector<f32>>,
    /// `[head]` scaled dot products
    pub raw: Vec<f32>,
    /// `[head]` sigmoid probabilities
    pub probs: Vec<f32>,
    /// Mean of the per-head probabilities
    pub fused: f32,
}

pub fn project_intent(params: &NetworkParams, intent: &DVector<f32>) -> DVector<f32> {
    &params.w_intent * intent
}

/// Score one capability embedding against a projected intent
pub fn score_embedding(
    params: &NetworkParams,
    intent_proj: &DVector<f32>,
    embedding: &DVector<f32>,
) -> HeadScores {
    let scale = (params.hidden_dim() as f32).sqrt();
    let mut queries = Vec::with_capacity(params.num_heads);
    let mut keys = Vec::with_capacity(params.num_heads);
    let mut raw = Vec::with_capacity(params.num_heads);
    let mut probs = Vec::with_capacity(params.num_heads);
    for h in 0..params.num_heads {
        let q = &params.scoring.w_query[h] * intent_proj;
        let k = &params.scoring.w_key[h] * embedding;
        let r = q.dot(&k) / scale;
        raw.push(r);
        probs.push(sigmoid(r));
        queries.push(q);
        keys.push(k);
    }
    let fused = probs.iter().sum::<f32>() / params.num_heads as f32;
    HeadScores {
        queries,
        keys,
        raw,
        probs,
        fused,
    }
}

/// Success-rate reliability multiplier applied to the reported score
pub fn reliability_multiplier(success_rate: f32) -> f32 {
    if success_rate < 0.5 {
        0.5
    } else if success_rate > 0.9 {
        1.2
    } else {
        1.0
    }
}

/// Rank every capability (optionally restricted to one level) against the
/// intent. Results are sorted descending; equal scores keep insertion order.
pub fn rank(
    store: &GraphStore,
    pass: &ForwardPass,
    params: &NetworkParams,
    intent: &DVector<f32>,
    target_level: Option<usize>,
) -> Vec<ScoreItem> {
    let intent_proj = project_intent(params, intent);
    let mut items = Vec::with_capacity(store.num_capabilities());

    for (cap, capability) in store.capabilities().iter().enumerate() {
        if let Some(level) = target_level {
            if capability.level != level {
                continue;
            }
        }
        let embedding = pass.capability_embedding(store, cap);
        let head_scores = score_embedding(params, &intent_proj, &embedding);
        let reliability = reliability_multiplier(capability.success_rate);
        let score = (head_scores.fused * reliability).min(SCORE_CEILING);
        items.push(ScoreItem {
            capability_id: capability.id.clone(),
            score,
            per_head_scores: head_scores.probs,
            hierarchy_level: capability.level,
        });
    }

    // Stable sort keeps insertion order for ties
    items.sort_by(|a, b| b.score.partial_cmp(&a.score).expect("scores are finite"));
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::forward;
    use crate::graph::Member;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_reliability_multiplier_bands() {
        assert_eq!(reliability_multiplier(0.0), 0.5);
        assert_eq!(reliability_multiplier(0.49), 0.5);
        assert_eq!(reliability_multiplier(0.5), 1.0);
        assert_eq!(reliability_multiplier(0.9), 1.0);
        assert_eq!(reliability_multiplier(0.91), 1.2);
        assert_eq!(reliability_multiplier(1.0), 1.2);
    }

    fn ranked_store() -> (GraphStore, NetworkParams) {
        let mut store = GraphStore::new(4);
        store.insert_tool("t1", vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        store.insert_tool("t2", vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        store
            .insert_capability("cap_a", vec![0.5; 4], vec![Member::Tool("t1".into())], 1.0)
            .unwrap();
        store
            .insert_capability("cap_b", vec![0.3; 4], vec![Member::Tool("t2".into())], 1.0)
            .unwrap();
        store
            .insert_capability(
                "meta",
                vec![0.1; 4],
                vec![
                    Member::Capability("cap_a".into()),
                    Member::Capability("cap_b".into()),
                ],
                0.7,
            )
            .unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut params = NetworkParams::init(&mut rng, 4, 4, 4);
        params.ensure_levels(&mut rng, store.num_levels());
        (store, params)
    }

    #[test]
    fn test_rank_is_sorted_and_bounded() {
        let (store, params) = ranked_store();
        let pass = forward(&store, &params);
        let intent = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]);
        let items = rank(&store, &pass, &params, &intent, None);
        assert_eq!(items.len(), 3);
        for pair in items.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for item in &items {
            assert!(item.score >= 0.0 && item.score <= SCORE_CEILING);
            assert_eq!(item.per_head_scores.len(), 4);
            for p in &item.per_head_scores {
                assert!(*p >= 0.0 && *p <= 1.0);
            }
        }
    }

    #[test]
    fn test_rank_level_filter() {
        let (store, params) = ranked_store();
        let pass = forward(&store, &params);
        let intent = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]);
        let level0 = rank(&store, &pass, &params, &intent, Some(0));
        assert_eq!(level0.len(), 2);
        assert!(level0.iter().all(|i| i.hierarchy_level == 0));
        let level1 = rank(&store, &pass, &params, &intent, Some(1));
        assert_eq!(level1.len(), 1);
        assert_eq!(level1[0].capability_id, "meta");
        let level9 = rank(&store, &pass, &params, &intent, Some(9));
        assert!(level9.is_empty());
    }

    #[test]
    fn test_low_reliability_halves_score() {
        let (mut store, params) = ranked_store();
        let pass = forward(&store, &params);
        let intent = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]);
        let before = rank(&store, &pass, &params, &intent, None);
        let cap_a_before = before
            .iter()
            .find(|i| i.capability_id == "cap_a")
            .unwrap()
            .score;

        store.update_success_rate("cap_a", 0.2).unwrap();
        let pass = forward(&store, &params);
        let after = rank(&store, &pass, &params, &intent, None);
        let cap_a_after = after
            .iter()
            .find(|i| i.capability_id == "cap_a")
            .unwrap()
            .score;
        assert!(cap_a_after < cap_a_before);
        if cap_a_before < SCORE_CEILING {
            assert!((cap_a_after - cap_a_before * 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fused_is_mean_of_heads() {
        let (store, params) = ranked_store();
        let pass = forward(&store, &params);
        let intent = DVector::from_vec(vec![0.2, 0.4, 0.1, 0.3]);
        let intent_proj = project_intent(&params, &intent);
        let cap = store.capability_idx("cap_a").unwrap();
        let e = pass.capability_embedding(&store, cap);
        let scores = score_embedding(&params, &intent_proj, &e);
        let mean = scores.probs.iter().sum::<f32>() / scores.probs.len() as f32;
        assert!((scores.fused - mean).abs() < 1e-6);
    }
}
