//! Learnable parameters: per-level attention weights, the intent projection,
//! and the K-head scoring matrices

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;

use crate::math::{attention_vector, xavier_matrix};

/// Scaled-initialization gain for the scoring matrices.
///
/// Load-bearing: with plain Xavier the query/key dot products start near
/// zero, every sigmoid lands at 0.5, and the gradients vanish.
pub const SCORING_INIT_GAIN: f32 = 10.0;

/// Candidate head counts for adaptive selection
const HEAD_LADDER: [usize; 5] = [4, 6, 8, 12, 16];

/// Attention parameters for one hierarchy level
#[derive(Debug, Clone, PartialEq)]
pub struct LevelParams {
    /// Per head: `head_dim x input_dim` projection for aggregation sources
    pub w_child: Vec<DMatrix<f32>>,
    /// Per head: `head_dim x input_dim` projection for aggregation targets
    pub w_parent: Vec<DMatrix<f32>>,
    /// Per head: length `2 * head_dim` scoring vector for the upward pass
    pub a_upward: Vec<DVector<f32>>,
    /// Per head: length `2 * head_dim` scoring vector for the downward pass
    pub a_downward: Vec<DVector<f32>>,
}

impl LevelParams {
    pub fn init(rng: &mut StdRng, num_heads: usize, head_dim: usize, input_dim: usize) -> Self {
        let mut w_child = Vec::with_capacity(num_heads);
        let mut w_parent = Vec::with_capacity(num_heads);
        let mut a_upward = Vec::with_capacity(num_heads);
        let mut a_downward = Vec::with_capacity(num_heads);
        for _ in 0..num_heads {
            w_child.push(xavier_matrix(rng, head_dim, input_dim, 1.0));
            w_parent.push(xavier_matrix(rng, head_dim, input_dim, 1.0));
            a_upward.push(attention_vector(rng, 2 * head_dim));
            a_downward.push(attention_vector(rng, 2 * head_dim));
        }
        Self {
            w_child,
            w_parent,
            a_upward,
            a_downward,
        }
    }

    pub fn num_heads(&self) -> usize {
        self.w_child.len()
    }

    pub fn input_dim(&self) -> usize {
        self.w_child[0].ncols()
    }

    pub fn parameter_count(&self) -> usize {
        let per_matrix: usize = self.w_child.iter().map(|m| m.len()).sum::<usize>()
            + self.w_parent.iter().map(|m| m.len()).sum::<usize>();
        let per_vector: usize = self.a_upward.iter().map(|v| v.len()).sum::<usize>()
            + self.a_downward.iter().map(|v| v.len()).sum::<usize>();
        per_matrix + per_vector
    }
}

/// K-head scoring parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringParams {
    /// Per head: `hidden_dim x hidden_dim` query projection
    pub w_query: Vec<DMatrix<f32>>,
    /// Per head: `hidden_dim x hidden_dim` key projection
    pub w_key: Vec<DMatrix<f32>>,
}

impl ScoringParams {
    pub fn init(rng: &mut StdRng, num_heads: usize, hidden_dim: usize) -> Self {
        let mut w_query = Vec::with_capacity(num_heads);
        let mut w_key = Vec::with_capacity(num_heads);
        for _ in 0..num_heads {
            w_query.push(xavier_matrix(rng, hidden_dim, hidden_dim, SCORING_INIT_GAIN));
            w_key.push(xavier_matrix(rng, hidden_dim, hidden_dim, SCORING_INIT_GAIN));
        }
        Self { w_query, w_key }
    }

    pub fn parameter_count(&self) -> usize {
        self.w_query.iter().map(|m| m.len()).sum::<usize>()
            + self.w_key.iter().map(|m| m.len()).sum::<usize>()
    }
}

/// All learnable state of the network.
///
/// Level parameters are created lazily when a level first participates in a
/// forward pass and released when the level vanishes; the scoring head and
/// the intent projection exist from construction.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkParams {
    pub embedding_dim: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    /// `hidden_dim x embedding_dim` intent projection
    pub w_intent: DMatrix<f32>,
    pub scoring: ScoringParams,
    /// Indexed by hierarchy level; contiguous
    pub levels: Vec<LevelParams>,
}

impl NetworkParams {
    pub fn init(
        rng: &mut StdRng,
        embedding_dim: usize,
        num_heads: usize,
        head_dim: usize,
    ) -> Self {
        let hidden_dim = num_heads * head_dim;
        Self {
            embedding_dim,
            num_heads,
            head_dim,
            w_intent: xavier_matrix(rng, hidden_dim, embedding_dim, 1.0),
            scoring: ScoringParams::init(rng, num_heads, hidden_dim),
            levels: Vec::new(),
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Level 0 projects raw embeddings; higher levels project hidden vectors
    pub fn input_dim_for_level(&self, level: usize) -> usize {
        if level == 0 {
            self.embedding_dim
        } else {
            self.hidden_dim()
        }
    }

    /// Materialize parameters for levels `0..num_levels`
    pub fn ensure_levels(&mut self, rng: &mut StdRng, num_levels: usize) {
        while self.levels.len() < num_levels {
            let level = self.levels.len();
            let input_dim = self.input_dim_for_level(level);
            self.levels
                .push(LevelParams::init(rng, self.num_heads, self.head_dim, input_dim));
        }
    }

    /// Release parameters of levels that no longer exist
    pub fn release_levels_above(&mut self, num_levels: usize) {
        if self.levels.len() > num_levels {
            self.levels.truncate(num_levels);
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.w_intent.len()
            + self.scoring.parameter_count()
            + self.levels.iter().map(|l| l.parameter_count()).sum::<usize>()
    }
}

/// Pick an even head count from the graph size; deeper hierarchies bias
/// upward by one or two steps.
pub fn adaptive_head_count(num_tools: usize, num_caps: usize, max_level: usize) -> usize {
    let total = num_tools + num_caps;
    let base = if total < 10 {
        0
    } else if total < 50 {
        1
    } else if total < 200 {
        2
    } else if total < 1000 {
        3
    } else {
        4
    };
    let bump = if max_level >= 5 {
        2
    } else if max_level >= 3 {
        1
    } else {
        0
    };
    HEAD_LADDER[(base + bump).min(HEAD_LADDER.len() - 1)]
}
