//! Multi-pass message-passing over the capability hypergraph
//!
//! One forward pass runs the upward aggregation (tools into level-0
//! capabilities, then level by level upward) followed by the downward
//! residual pass (parents back into children, then into the tool tier).
//! Every aggregation site keeps its projections, raw scores, attention
//! weights, and pre-activation sums so the trainer can replay the pass
//! backwards without recomputation.

use nalgebra::{DMatrix, DVector};

use crate::graph::GraphStore;
use crate::math::{elu, leaky_relu, lift, softmax};
use crate::params::NetworkParams;

/// Reference to a node participating in message passing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Tool(usize),
    Capability(usize),
}

/// One upward aggregation: a capability folding its direct members
#[derive(Debug, Clone)]
pub struct UpwardSite {
    pub level: usize,
    pub cap: usize,
    /// Row of the capability inside its level buffer
    pub row: usize,
    pub children: Vec<NodeRef>,
    /// `[head][child]` projections of the aggregation sources
    pub child_proj: Vec<Vec<DVector<f32>>>,
    /// `[head]` projection of the aggregating capability
    pub parent_proj: Vec<DVector<f32>>,
    /// `[head]` raw pre-softmax scores, one entry per child
    pub scores: Vec<DVector<f32>>,
    /// `[head]` attention weights, one entry per child
    pub attention: Vec<DVector<f32>>,
    /// `[head]` attention-weighted sums before the ELU
    pub pre_activation: Vec<DVector<f32>>,
}

/// One downward aggregation: a node folding its direct parents
#[derive(Debug, Clone)]
pub struct DownwardSite {
    pub target: NodeRef,
    /// Row of the target inside its buffer (level buffer or tool tier)
    pub row: usize,
    /// Direct parent capabilities, in incidence order
    pub parents: Vec<usize>,
    /// `[head][parent]` projections of the parent sources
    pub parent_proj: Vec<Vec<DVector<f32>>>,
    /// `[head][parent]` projections of the target, one per parent because
    /// parents at different levels project through different matrices
    pub target_proj: Vec<Vec<DVector<f32>>>,
    pub scores: Vec<DVector<f32>>,
    pub attention: Vec<DVector<f32>>,
    pub pre_activation: Vec<DVector<f32>>,
}

/// Forward-pass output plus everything the backward pass needs
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Tools lifted through the level-0 child projection, `num_tools x hidden`
    pub h_lift: DMatrix<f32>,
    /// Tool embeddings after the downward residual
    pub h_final: DMatrix<f32>,
    /// Per level: lifted intrinsic capability embeddings
    pub e_init: Vec<DMatrix<f32>>,
    /// Per level: embeddings after the upward pass
    pub e_up: Vec<DMatrix<f32>>,
    /// Per level: embeddings after the downward residual
    pub e_final: Vec<DMatrix<f32>>,
    /// Upward sites in execution order (levels ascending)
    pub upward_sites: Vec<UpwardSite>,
    /// Downward sites in execution order (levels descending, tools last)
    pub downward_sites: Vec<DownwardSite>,
    /// Capability arena index -> row within its level buffer
    pub level_row: Vec<usize>,
}

impl ForwardPass {
    /// Final embedding of a capability by arena index
    pub fn capability_embedding(&self, store: &GraphStore, cap: usize) -> DVector<f32> {
        let level = store.capabilities()[cap].level;
        self.e_final[level].row(self.level_row[cap]).transpose()
    }

    /// Upward attention sites of one level, for interpretability
    pub fn upward_sites_at(&self, level: usize) -> impl Iterator<Item = &UpwardSite> {
        self.upward_sites.iter().filter(move |s| s.level == level)
    }

    /// Downward attention site of one capability, if it has parents
    pub fn downward_site_for(&self, cap: usize) -> Option<&DownwardSite> {
        self.downward_sites
            .iter()
            .find(|s| s.target == NodeRef::Capability(cap))
    }
}

/// Run the full upward + downward pass.
///
/// Expects `params.levels` to cover every inhabited level; the engine
/// guarantees this before calling.
pub fn forward(store: &GraphStore, params: &NetworkParams) -> ForwardPass {
    let hidden_dim = params.hidden_dim();
    let num_levels = store.num_levels();
    let num_heads = params.num_heads;
    assert!(
        params.levels.len() >= num_levels,
        "level parameters missing for an inhabited level"
    );

    let mut level_row = vec![0usize; store.num_capabilities()];
    for level in 0..num_levels {
        for (row, &cap) in store.caps_at_level(level).iter().enumerate() {
            level_row[cap] = row;
        }
    }

    // Lift tools through the level-0 child projection when it exists;
    // an empty graph falls back to the deterministic dimension adapter.
    let mut h_lift = DMatrix::zeros(store.num_tools(), hidden_dim);
    for (t, tool) in store.tools().iter().enumerate() {
        let lifted = if num_levels > 0 {
            let level0 = &params.levels[0];
            let mut out = DVector::zeros(hidden_dim);
            for h in 0..num_heads {
                let proj = &level0.w_child[h] * &tool.embedding;
                out.rows_mut(h * params.head_dim, params.head_dim)
                    .copy_from(&proj);
            }
            out
        } else {
            lift(&tool.embedding, hidden_dim)
        };
        h_lift.set_row(t, &lifted.transpose());
    }

    let mut e_init = Vec::with_capacity(num_levels);
    for level in 0..num_levels {
        let caps = store.caps_at_level(level);
        let mut buf = DMatrix::zeros(caps.len(), hidden_dim);
        for (row, &cap) in caps.iter().enumerate() {
            let lifted = lift(&store.capabilities()[cap].embedding, hidden_dim);
            buf.set_row(row, &lifted.transpose());
        }
        e_init.push(buf);
    }

    let mut e_up = e_init.clone();
    let mut upward_sites = Vec::new();

    // Upward pass: levels ascending, capabilities in insertion order
    for level in 0..num_levels {
        let level_params = &params.levels[level];
        for (row, &cap) in store.caps_at_level(level).iter().enumerate() {
            let children: Vec<NodeRef> = if level == 0 {
                store.incidence().cap_to_tools[cap]
                    .iter()
                    .map(|&t| NodeRef::Tool(t))
                    .collect()
            } else {
                store.incidence().parent_to_children[cap]
                    .iter()
                    .map(|&c| NodeRef::Capability(c))
                    .collect()
            };
            if children.is_empty() {
                // Keeps its lifted intrinsic embedding; no aggregation
                continue;
            }

            let parent_input: DVector<f32> = if level == 0 {
                store.capabilities()[cap].embedding.clone()
            } else {
                e_init[level].row(row).transpose()
            };

            let mut child_proj = Vec::with_capacity(num_heads);
            let mut parent_proj = Vec::with_capacity(num_heads);
            let mut scores = Vec::with_capacity(num_heads);
            let mut attention = Vec::with_capacity(num_heads);
            let mut pre_activation = Vec::with_capacity(num_heads);
            let mut output = DVector::zeros(hidden_dim);

            for h in 0..num_heads {
                let p_proj = &level_params.w_parent[h] * &parent_input;
                let mut c_proj = Vec::with_capacity(children.len());
                let mut s = DVector::zeros(children.len());
                for (i, child) in children.iter().enumerate() {
                    let input: DVector<f32> = match child {
                        NodeRef::Tool(t) => store.tools()[*t].embedding.clone(),
                        NodeRef::Capability(c) => {
                            let child_level = store.capabilities()[*c].level;
                            e_up[child_level].row(level_row[*c]).transpose()
                        }
                    };
                    let proj = &level_params.w_child[h] * &input;
                    s[i] = attention_score(&level_params.a_upward[h], &proj, &p_proj);
                    c_proj.push(proj);
                }
                let alpha = softmax(&s);
                let mut z = DVector::zeros(params.head_dim);
                for (i, proj) in c_proj.iter().enumerate() {
                    z += proj * alpha[i];
                }
                let activated = z.map(elu);
                output
                    .rows_mut(h * params.head_dim, params.head_dim)
                    .copy_from(&activated);

                child_proj.push(c_proj);
                parent_proj.push(p_proj);
                scores.push(s);
                attention.push(alpha);
                pre_activation.push(z);
            }

            e_up[level].set_row(row, &output.transpose());
            upward_sites.push(UpwardSite {
                level,
                cap,
                row,
                children,
                child_proj,
                parent_proj,
                scores,
                attention,
                pre_activation,
            });
        }
    }

    // Downward pass: levels descending, residual additions, tool tier last
    let mut e_final = e_up.clone();
    let mut downward_sites = Vec::new();

    for level in (0..num_levels.saturating_sub(1)).rev() {
        for (row, &cap) in store.caps_at_level(level).iter().enumerate() {
            let parents = store.incidence().child_to_parents[cap].clone();
            if parents.is_empty() {
                continue;
            }

            let target_input: DVector<f32> = e_up[level].row(row).transpose();
            let mut parent_proj = Vec::with_capacity(num_heads);
            let mut target_proj = Vec::with_capacity(num_heads);
            let mut scores = Vec::with_capacity(num_heads);
            let mut attention = Vec::with_capacity(num_heads);
            let mut pre_activation = Vec::with_capacity(num_heads);
            let mut residual = DVector::zeros(hidden_dim);

            for h in 0..num_heads {
                let mut p_proj = Vec::with_capacity(parents.len());
                let mut t_proj = Vec::with_capacity(parents.len());
                let mut s = DVector::zeros(parents.len());
                for (j, &parent) in parents.iter().enumerate() {
                    let p_level = store.capabilities()[parent].level;
                    let level_params = &params.levels[p_level];
                    let p_input: DVector<f32> =
                        e_final[p_level].row(level_row[parent]).transpose();
                    let pp = &level_params.w_parent[h] * &p_input;
                    let tp = &level_params.w_child[h] * &target_input;
                    s[j] = attention_score(&level_params.a_downward[h], &pp, &tp);
                    p_proj.push(pp);
                    t_proj.push(tp);
                }
                let alpha = softmax(&s);
                let mut z = DVector::zeros(params.head_dim);
                for (j, proj) in p_proj.iter().enumerate() {
                    z += proj * alpha[j];
                }
                let activated = z.map(elu);
                residual
                    .rows_mut(h * params.head_dim, params.head_dim)
                    .copy_from(&activated);

                parent_proj.push(p_proj);
                target_proj.push(t_proj);
                scores.push(s);
                attention.push(alpha);
                pre_activation.push(z);
            }

            let updated = e_final[level].row(row).transpose() + residual;
            e_final[level].set_row(row, &updated.transpose());
            downward_sites.push(DownwardSite {
                target: NodeRef::Capability(cap),
                row,
                parents,
                parent_proj,
                target_proj,
                scores,
                attention,
                pre_activation,
            });
        }
    }

    // Tool tier: level-0 parents feed back into their tools
    let mut h_final = h_lift.clone();
    for t in 0..store.num_tools() {
        let parents = store.incidence().tool_to_caps[t].clone();
        if parents.is_empty() || num_levels == 0 {
            continue;
        }
        let level0 = &params.levels[0];

        let mut parent_proj = Vec::with_capacity(num_heads);
        let mut target_proj = Vec::with_capacity(num_heads);
        let mut scores = Vec::with_capacity(num_heads);
        let mut attention = Vec::with_capacity(num_heads);
        let mut pre_activation = Vec::with_capacity(num_heads);
        let mut residual = DVector::zeros(hidden_dim);

        for h in 0..num_heads {
            // The lifted tool already holds the per-head child projection
            let tool_proj: DVector<f32> = h_lift
                .row(t)
                .columns(h * params.head_dim, params.head_dim)
                .transpose();
            let mut p_proj = Vec::with_capacity(parents.len());
            let mut t_proj = Vec::with_capacity(parents.len());
            let mut s = DVector::zeros(parents.len());
            for (j, &parent) in parents.iter().enumerate() {
                // Level-0 projections operate in input space, so the parent
                // enters through its intrinsic embedding
                let pp = &level0.w_parent[h] * &store.capabilities()[parent].embedding;
                s[j] = attention_score(&level0.a_downward[h], &pp, &tool_proj);
                p_proj.push(pp);
                t_proj.push(tool_proj.clone());
            }
            let alpha = softmax(&s);
            let mut z = DVector::zeros(params.head_dim);
            for (j, proj) in p_proj.iter().enumerate() {
                z += proj * alpha[j];
            }
            let activated = z.map(elu);
            residual
                .rows_mut(h * params.head_dim, params.head_dim)
                .copy_from(&activated);

            parent_proj.push(p_proj);
            target_proj.push(t_proj);
            scores.push(s);
            attention.push(alpha);
            pre_activation.push(z);
        }

        let updated = h_final.row(t).transpose() + residual;
        h_final.set_row(t, &updated.transpose());
        downward_sites.push(DownwardSite {
            target: NodeRef::Tool(t),
            row: t,
            parents,
            parent_proj,
            target_proj,
            scores,
            attention,
            pre_activation,
        });
    }

    ForwardPass {
        h_lift,
        h_final,
        e_init,
        e_up,
        e_final,
        upward_sites,
        downward_sites,
        level_row,
    }
}

/// Raw attention score: `a . LeakyReLU(concat(source_proj, target_proj))`
fn attention_score(a: &DVector<f32>, source: &DVector<f32>, target: &DVector<f32>) -> f32 {
    let head_dim = source.len();
    let mut acc = 0.0f32;
    for i in 0..head_dim {
        acc += a[i] * leaky_relu(source[i]);
    }
    for i in 0..head_dim {
        acc += a[head_dim + i] * leaky_relu(target[i]);
    }
    acc
}
