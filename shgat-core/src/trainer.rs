//! Hand-derived back-propagation and the SGD update
//!
//! The trainer replays a cached forward pass in reverse: scoring head,
//! intent projection, downward pass, then upward pass. Gradients accumulate
//! into a mirror of the parameter tree and are applied only after every
//! entry proves finite, so a failed step leaves the parameters untouched.

use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::forward::{ForwardPass, NodeRef};
use crate::graph::GraphStore;
use crate::math::{
    bce_gradient, bce_loss, elu_derivative, leaky_relu, leaky_relu_derivative,
};
use crate::params::NetworkParams;
use crate::scorer;
use crate::{Error, Result};

/// Outcome of one successful gradient step
#[derive(Debug, Clone)]
pub struct TrainResult {
    pub loss: f32,
    pub accuracy: f32,
    /// Raw fused probability the loss was computed on
    pub predicted: f32,
    /// Per-group L2 norms of the accumulated gradients
    pub gradient_norms: HashMap<String, f32>,
}

/// Gradient accumulators mirroring one level's parameters
struct LevelGrads {
    w_child: Vec<DMatrix<f32>>,
    w_parent: Vec<DMatrix<f32>>,
    a_upward: Vec<DVector<f32>>,
    a_downward: Vec<DVector<f32>>,
}

/// Gradient accumulators mirroring the full parameter tree
struct ParamGrads {
    w_intent: DMatrix<f32>,
    w_query: Vec<DMatrix<f32>>,
    w_key: Vec<DMatrix<f32>>,
    levels: Vec<LevelGrads>,
}

impl ParamGrads {
    fn zeros_like(params: &NetworkParams) -> Self {
        Self {
            w_intent: DMatrix::zeros(params.w_intent.nrows(), params.w_intent.ncols()),
            w_query: params
                .scoring
                .w_query
                .iter()
                .map(|m| DMatrix::zeros(m.nrows(), m.ncols()))
                .collect(),
            w_key: params
                .scoring
                .w_key
                .iter()
                .map(|m| DMatrix::zeros(m.nrows(), m.ncols()))
                .collect(),
            levels: params
                .levels
                .iter()
                .map(|l| LevelGrads {
                    w_child: l
                        .w_child
                        .iter()
                        .map(|m| DMatrix::zeros(m.nrows(), m.ncols()))
                        .collect(),
                    w_parent: l
                        .w_parent
                        .iter()
                        .map(|m| DMatrix::zeros(m.nrows(), m.ncols()))
                        .collect(),
                    a_upward: l.a_upward.iter().map(|v| DVector::zeros(v.len())).collect(),
                    a_downward: l
                        .a_downward
                        .iter()
                        .map(|v| DVector::zeros(v.len()))
                        .collect(),
                })
                .collect(),
        }
    }

    /// Per-group gradient norms for monitoring
    fn norms(&self) -> HashMap<String, f32> {
        let mut norms = HashMap::new();
        norms.insert(
            "w_intent".to_string(),
            crate::math::group_norm(&[&self.w_intent], &[]),
        );
        norms.insert(
            "w_query".to_string(),
            crate::math::group_norm(&self.w_query.iter().collect::<Vec<_>>(), &[]),
        );
        norms.insert(
            "w_key".to_string(),
            crate::math::group_norm(&self.w_key.iter().collect::<Vec<_>>(), &[]),
        );
        for (k, level) in self.levels.iter().enumerate() {
            let matrices: Vec<&DMatrix<f32>> =
                level.w_child.iter().chain(level.w_parent.iter()).collect();
            let vectors: Vec<&DVector<f32>> =
                level.a_upward.iter().chain(level.a_downward.iter()).collect();
            norms.insert(
                format!("level{}", k),
                crate::math::group_norm(&matrices, &vectors),
            );
        }
        norms
    }

    /// First non-finite gradient entry, reported as the step-aborting error
    fn first_bad_group(&self) -> Option<Error> {
        let mut check = |matrices: &[&DMatrix<f32>], vectors: &[&DVector<f32>], name: &str| {
            crate::math::first_non_finite(matrices, vectors).map(|v| {
                if v.is_nan() {
                    Error::NaNGradient(name.to_string())
                } else {
                    Error::InfGradient(name.to_string())
                }
            })
        };
        if let Some(err) = check(&[&self.w_intent], &[], "w_intent") {
            return Some(err);
        }
        if let Some(err) = check(&self.w_query.iter().collect::<Vec<_>>(), &[], "w_query") {
            return Some(err);
        }
        if let Some(err) = check(&self.w_key.iter().collect::<Vec<_>>(), &[], "w_key") {
            return Some(err);
        }
        for (k, level) in self.levels.iter().enumerate() {
            let matrices: Vec<&DMatrix<f32>> =
                level.w_child.iter().chain(level.w_parent.iter()).collect();
            let vectors: Vec<&DVector<f32>> =
                level.a_upward.iter().chain(level.a_downward.iter()).collect();
            if let Some(err) = check(&matrices, &vectors, &format!("level{}", k)) {
                return Some(err);
            }
        }
        None
    }
}

/// One online gradient step against a cached forward pass.
///
/// `outcome` is the {0,1} label; the loss is binary cross-entropy on the raw
/// fused probability, without the reliability multiplier.
#[allow(clippy::too_many_arguments)]
pub fn train_step(
    store: &GraphStore,
    params: &mut NetworkParams,
    pass: &ForwardPass,
    intent: &DVector<f32>,
    target_cap: usize,
    outcome: f32,
    learning_rate: f32,
    l2_lambda: f32,
    warn_norm: f32,
) -> Result<TrainResult> {
    let num_heads = params.num_heads;
    let head_dim = params.head_dim;
    let hidden_dim = params.hidden_dim();
    let scale = (hidden_dim as f32).sqrt();

    // Scoring head forward (cheap; the expensive pass is already cached)
    let intent_proj = scorer::project_intent(params, intent);
    let target_level = store.capabilities()[target_cap].level;
    let target_embedding = pass.capability_embedding(store, target_cap);
    let head_scores = scorer::score_embedding(params, &intent_proj, &target_embedding);

    let p = head_scores.fused;
    let loss = bce_loss(p, outcome);
    let accuracy = if (p >= 0.5) == (outcome >= 0.5) { 1.0 } else { 0.0 };

    let mut grads = ParamGrads::zeros_like(params);

    // Through mean fusion, sigmoid, the 1/sqrt(d) scale, and the dot product
    let dp = bce_gradient(p, outcome);
    let mut d_intent_proj = DVector::zeros(hidden_dim);
    let mut d_embedding = DVector::zeros(hidden_dim);
    for h in 0..num_heads {
        let dp_h = dp / num_heads as f32;
        let dr_h = head_scores.probs[h] * (1.0 - head_scores.probs[h]) * dp_h;
        let d_dot = dr_h / scale;
        let dq = &head_scores.keys[h] * d_dot;
        let dk = &head_scores.queries[h] * d_dot;
        grads.w_query[h] += &dq * intent_proj.transpose();
        grads.w_key[h] += &dk * target_embedding.transpose();
        d_intent_proj += params.scoring.w_query[h].tr_mul(&dq);
        d_embedding += params.scoring.w_key[h].tr_mul(&dk);
    }
    grads.w_intent += &d_intent_proj * intent.transpose();

    // Per-level embedding gradients, seeded at the target capability
    let mut d_e: Vec<DMatrix<f32>> = pass
        .e_final
        .iter()
        .map(|m| DMatrix::zeros(m.nrows(), m.ncols()))
        .collect();
    add_to_row(
        &mut d_e[target_level],
        pass.level_row[target_cap],
        &d_embedding,
    );

    backward_downward(store, params, pass, &mut grads, &mut d_e, head_dim, num_heads);
    backward_upward(store, params, pass, &mut grads, &mut d_e, head_dim, num_heads);

    if let Some(err) = grads.first_bad_group() {
        warn!(error = %err, "aborting training step, parameters unchanged");
        return Err(err);
    }

    let gradient_norms = grads.norms();
    for (group, norm) in &gradient_norms {
        if *norm > warn_norm {
            warn!(group = %group, norm = *norm, "gradient norm spike");
        }
    }
    debug!(loss, accuracy, ?gradient_norms, "training step");

    apply_sgd(params, &grads, learning_rate, l2_lambda);

    Ok(TrainResult {
        loss,
        accuracy,
        predicted: p,
        gradient_norms,
    })
}

/// Reverse the downward pass: tool tier first, then levels ascending.
///
/// On entry `d_e` holds gradients with respect to the post-residual
/// embeddings; on exit it holds gradients with respect to the upward-pass
/// outputs.
fn backward_downward(
    store: &GraphStore,
    params: &NetworkParams,
    pass: &ForwardPass,
    grads: &mut ParamGrads,
    d_e: &mut [DMatrix<f32>],
    head_dim: usize,
    num_heads: usize,
) {
    for site in pass.downward_sites.iter().rev() {
        // Tool-tier targets carry no loss gradient: scoring reads only
        // capability embeddings.
        let (target_cap, target_level) = match site.target {
            NodeRef::Tool(_) => continue,
            NodeRef::Capability(cap) => (cap, store.capabilities()[cap].level),
        };
        let g: DVector<f32> = d_e[target_level].row(site.row).transpose();
        if g.iter().all(|v| *v == 0.0) {
            continue;
        }

        let target_input: DVector<f32> = pass.e_up[target_level].row(site.row).transpose();

        for h in 0..num_heads {
            let g_h: DVector<f32> = g.rows(h * head_dim, head_dim).into_owned();
            let dz: DVector<f32> = g_h.zip_map(&site.pre_activation[h], |gi, zi| {
                gi * elu_derivative(zi)
            });

            let alpha = &site.attention[h];
            let n = site.parents.len();

            // Direct path plus the attention-weight path
            let mut d_alpha = DVector::zeros(n);
            for j in 0..n {
                d_alpha[j] = dz.dot(&site.parent_proj[h][j]);
            }
            let weighted: f32 = alpha.dot(&d_alpha);
            for (j, &parent) in site.parents.iter().enumerate() {
                let ds_j = alpha[j] * (d_alpha[j] - weighted);
                let p_level = store.capabilities()[parent].level;

                let u = concat(&site.parent_proj[h][j], &site.target_proj[h][j]);
                let v = u.map(leaky_relu);
                grads.levels[p_level].a_downward[h] += &v * ds_j;

                let a = &params.levels[p_level].a_downward[h];
                let du: DVector<f32> =
                    u.zip_map(a, |ui, ai| ai * leaky_relu_derivative(ui) * ds_j);

                let mut d_parent_proj: DVector<f32> = du.rows(0, head_dim).into_owned();
                d_parent_proj += &dz * alpha[j];
                let d_target_proj: DVector<f32> = du.rows(head_dim, head_dim).into_owned();

                let parent_input: DVector<f32> =
                    pass.e_final[p_level].row(pass.level_row[parent]).transpose();
                grads.levels[p_level].w_parent[h] += &d_parent_proj * parent_input.transpose();
                let d_parent_input = params.levels[p_level].w_parent[h].tr_mul(&d_parent_proj);
                add_to_row(&mut d_e[p_level], pass.level_row[parent], &d_parent_input);

                grads.levels[p_level].w_child[h] += &d_target_proj * target_input.transpose();
                let d_target_input = params.levels[p_level].w_child[h].tr_mul(&d_target_proj);
                add_to_row(&mut d_e[target_level], site.row, &d_target_input);
            }
        }
    }
}

/// Reverse the upward pass: levels descending, propagating into children
fn backward_upward(
    store: &GraphStore,
    params: &NetworkParams,
    pass: &ForwardPass,
    grads: &mut ParamGrads,
    d_e: &mut [DMatrix<f32>],
    head_dim: usize,
    num_heads: usize,
) {
    for site in pass.upward_sites.iter().rev() {
        let g: DVector<f32> = d_e[site.level].row(site.row).transpose();
        if g.iter().all(|v| *v == 0.0) {
            continue;
        }

        let parent_input: DVector<f32> = if site.level == 0 {
            store.capabilities()[site.cap].embedding.clone()
        } else {
            pass.e_init[site.level].row(site.row).transpose()
        };

        for h in 0..num_heads {
            let g_h: DVector<f32> = g.rows(h * head_dim, head_dim).into_owned();
            let dz: DVector<f32> = g_h.zip_map(&site.pre_activation[h], |gi, zi| {
                gi * elu_derivative(zi)
            });

            let alpha = &site.attention[h];
            let n = site.children.len();

            let mut d_alpha = DVector::zeros(n);
            for i in 0..n {
                d_alpha[i] = dz.dot(&site.child_proj[h][i]);
            }
            let weighted: f32 = alpha.dot(&d_alpha);

            let mut d_parent_proj = DVector::zeros(head_dim);
            for (i, child) in site.children.iter().enumerate() {
                let ds_i = alpha[i] * (d_alpha[i] - weighted);

                let u = concat(&site.child_proj[h][i], &site.parent_proj[h]);
                let v = u.map(leaky_relu);
                grads.levels[site.level].a_upward[h] += &v * ds_i;

                let a = &params.levels[site.level].a_upward[h];
                let du: DVector<f32> =
                    u.zip_map(a, |ui, ai| ai * leaky_relu_derivative(ui) * ds_i);

                let mut d_child_proj: DVector<f32> = du.rows(0, head_dim).into_owned();
                d_child_proj += &dz * alpha[i];
                d_parent_proj += du.rows(head_dim, head_dim).into_owned();

                let child_input: DVector<f32> = match child {
                    NodeRef::Tool(t) => store.tools()[*t].embedding.clone(),
                    NodeRef::Capability(c) => {
                        let child_level = store.capabilities()[*c].level;
                        pass.e_up[child_level].row(pass.level_row[*c]).transpose()
                    }
                };
                grads.levels[site.level].w_child[h] += &d_child_proj * child_input.transpose();

                // Tool embeddings are immutable; capability gradients keep
                // flowing into the lower level
                if let NodeRef::Capability(c) = child {
                    let child_level = store.capabilities()[*c].level;
                    let d_child_input =
                        params.levels[site.level].w_child[h].tr_mul(&d_child_proj);
                    add_to_row(&mut d_e[child_level], pass.level_row[*c], &d_child_input);
                }
            }

            grads.levels[site.level].w_parent[h] += &d_parent_proj * parent_input.transpose();
            // The parent input is an intrinsic (or lifted intrinsic)
            // embedding, which is not trained; its gradient ends here.
        }
    }
}

/// SGD with L2 regularization: `theta -= lr * (grad + lambda * theta)`
fn apply_sgd(params: &mut NetworkParams, grads: &ParamGrads, lr: f32, lambda: f32) {
    let update_matrix = |t: &mut DMatrix<f32>, g: &DMatrix<f32>| {
        t.zip_apply(g, |ti, gi| *ti -= lr * (gi + lambda * *ti));
    };
    let update_vector = |t: &mut DVector<f32>, g: &DVector<f32>| {
        t.zip_apply(g, |ti, gi| *ti -= lr * (gi + lambda * *ti));
    };

    update_matrix(&mut params.w_intent, &grads.w_intent);
    for h in 0..params.num_heads {
        update_matrix(&mut params.scoring.w_query[h], &grads.w_query[h]);
        update_matrix(&mut params.scoring.w_key[h], &grads.w_key[h]);
    }
    for (level, level_grads) in params.levels.iter_mut().zip(grads.levels.iter()) {
        for h in 0..level.w_child.len() {
            update_matrix(&mut level.w_child[h], &level_grads.w_child[h]);
            update_matrix(&mut level.w_parent[h], &level_grads.w_parent[h]);
            update_vector(&mut level.a_upward[h], &level_grads.a_upward[h]);
            update_vector(&mut level.a_downward[h], &level_grads.a_downward[h]);
        }
    }
}

fn add_to_row(m: &mut DMatrix<f32>, row: usize, v: &DVector<f32>) {
    for (j, x) in v.iter().enumerate() {
        m[(row, j)] += x;
    }
}

fn concat(a: &DVector<f32>, b: &DVector<f32>) -> DVector<f32> {
    let mut out = DVector::zeros(a.len() + b.len());
    out.rows_mut(0, a.len()).copy_from(a);
    out.rows_mut(a.len(), b.len()).copy_from(b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::forward;
    use crate::graph::Member;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn training_fixture() -> (GraphStore, NetworkParams) {
        let mut store = GraphStore::new(4);
        store.insert_tool("t1", vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        store.insert_tool("t2", vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        store.insert_tool("t3", vec![0.0, 0.0, 1.0, 0.0]).unwrap();
        store
            .insert_capability(
                "cap_a",
                vec![0.5, 0.5, 0.0, 0.0],
                vec![Member::Tool("t1".into()), Member::Tool("t2".into())],
                1.0,
            )
            .unwrap();
        store
            .insert_capability(
                "cap_b",
                vec![0.0, 0.0, 1.0, 0.0],
                vec![Member::Tool("t3".into())],
                1.0,
            )
            .unwrap();
        store
            .insert_capability(
                "meta_ab",
                vec![0.25; 4],
                vec![
                    Member::Capability("cap_a".into()),
                    Member::Capability("cap_b".into()),
                ],
                1.0,
            )
            .unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut params = NetworkParams::init(&mut rng, 4, 4, 4);
        params.ensure_levels(&mut rng, store.num_levels());
        (store, params)
    }

    fn intent() -> DVector<f32> {
        DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0])
    }

    #[test]
    fn test_loss_decreases_on_repetition() {
        let (store, mut params) = training_fixture();
        let target = store.capability_idx("cap_a").unwrap();
        let mut losses = Vec::new();
        for _ in 0..20 {
            let pass = forward(&store, &params);
            let result = train_step(
                &store, &mut params, &pass, &intent(), target, 1.0, 0.5, 0.0, 100.0,
            )
            .unwrap();
            losses.push(result.loss);
        }
        assert!(
            losses[19] < losses[0],
            "loss did not decrease: {} -> {}",
            losses[0],
            losses[19]
        );
    }

    #[test]
    fn test_parameters_stay_finite() {
        let (store, mut params) = training_fixture();
        let target = store.capability_idx("meta_ab").unwrap();
        for step in 0..10 {
            let pass = forward(&store, &params);
            let outcome = if step % 2 == 0 { 1.0 } else { 0.0 };
            train_step(
                &store, &mut params, &pass, &intent(), target, outcome, 1.0, 1e-4, 100.0,
            )
            .unwrap();
        }
        assert!(params.w_intent.iter().all(|v| v.is_finite()));
        for level in &params.levels {
            assert!(level.w_child.iter().all(|m| m.iter().all(|v| v.is_finite())));
            assert!(level.a_upward.iter().all(|v| v.iter().all(|x| x.is_finite())));
        }
    }

    #[test]
    fn test_gradients_touch_every_group() {
        let (store, mut params) = training_fixture();
        let target = store.capability_idx("cap_a").unwrap();
        let pass = forward(&store, &params);
        let result = train_step(
            &store, &mut params, &pass, &intent(), target, 1.0, 0.1, 0.0, 100.0,
        )
        .unwrap();
        // cap_a sits at level 0 under a level-1 parent, so both levels get
        // gradient signal, as do the scoring head and the intent projection
        assert!(result.gradient_norms["w_intent"] > 0.0);
        assert!(result.gradient_norms["w_query"] > 0.0);
        assert!(result.gradient_norms["w_key"] > 0.0);
        assert!(result.gradient_norms["level0"] > 0.0);
        assert!(result.gradient_norms["level1"] > 0.0);
    }

    #[test]
    fn test_non_finite_gradients_abort_without_update() {
        let (store, mut params) = training_fixture();
        let target = store.capability_idx("cap_a").unwrap();
        let pass = forward(&store, &params);
        // Poison the cached embedding the trainer will read
        let mut poisoned = pass.clone();
        let row = poisoned.level_row[target];
        poisoned.e_final[0][(row, 0)] = f32::NAN;

        let before = params.clone();
        let err = train_step(
            &store, &mut params, &poisoned, &intent(), target, 1.0, 0.1, 0.0, 100.0,
        );
        assert!(err.is_err());
        assert!(err.unwrap_err().is_numerical());
        // Nothing was applied
        assert_eq!(before.w_intent, params.w_intent);
        assert_eq!(before.scoring, params.scoring);
    }

    #[test]
    fn test_zero_learning_rate_keeps_params() {
        let (store, mut params) = training_fixture();
        let target = store.capability_idx("cap_b").unwrap();
        let before = params.clone();
        let pass = forward(&store, &params);
        // lr = 0 is rejected at the config layer; the kernel itself treats
        // it as a no-op update
        train_step(
            &store, &mut params, &pass, &intent(), target, 1.0, 0.0, 0.0, 100.0,
        )
        .unwrap();
        assert_eq!(before, params);
    }
}
