//! The engine aggregate: graph, parameters, and the public operations

use nalgebra::DVector;
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::debug;

use crate::blob;
use crate::config::EngineConfig;
use crate::forward::{self, ForwardPass};
use crate::graph::{GraphStore, Member};
use crate::params::{adaptive_head_count, NetworkParams};
use crate::scorer::{self, ScoreItem};
use crate::trainer::{self, TrainResult};
use crate::{Error, Result};

/// Single-threaded engine owning the hypergraph and all learnable state.
///
/// Every operation takes `&mut self`; concurrent hosts serialize through
/// [`SharedEngine`]. Given a fixed seed and a fixed sequence of operations,
/// all outputs are bit-identical across runs on one platform.
pub struct ShgatEngine {
    config: EngineConfig,
    store: GraphStore,
    params: Option<NetworkParams>,
    rng: StdRng,
}

impl ShgatEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        let store = GraphStore::new(config.embedding_dim);
        Ok(Self {
            config,
            store,
            params: None,
            rng,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    /// Head count in use, once parameters have been materialized
    pub fn num_heads(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.num_heads)
    }

    pub fn hidden_dim(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.hidden_dim())
    }

    pub fn insert_tool(&mut self, id: &str, embedding: Vec<f32>) -> Result<()> {
        self.store.insert_tool(id, embedding)?;
        self.sync_level_params();
        Ok(())
    }

    pub fn insert_capability(
        &mut self,
        id: &str,
        embedding: Vec<f32>,
        members: Vec<Member>,
        success_rate: f32,
    ) -> Result<()> {
        self.store
            .insert_capability(id, embedding, members, success_rate)?;
        self.sync_level_params();
        Ok(())
    }

    pub fn replace_members(&mut self, id: &str, members: Vec<Member>) -> Result<()> {
        self.store.replace_members(id, members)?;
        self.sync_level_params();
        Ok(())
    }

    pub fn update_success_rate(&mut self, id: &str, rate: f32) -> Result<()> {
        self.store.update_success_rate(id, rate)
    }

    /// Run a full message-passing pass and return it with its caches
    pub fn forward(&mut self) -> Result<ForwardPass> {
        self.ensure_params();
        let params = self.params.as_ref().expect("params were just ensured");
        Ok(forward::forward(&self.store, params))
    }

    /// Rank every capability against the intent
    pub fn score(&mut self, intent: &[f32]) -> Result<Vec<ScoreItem>> {
        self.score_internal(intent, None)
    }

    /// Rank only the capabilities at one hierarchy level
    pub fn score_at_level(&mut self, intent: &[f32], level: usize) -> Result<Vec<ScoreItem>> {
        self.score_internal(intent, Some(level))
    }

    fn score_internal(
        &mut self,
        intent: &[f32],
        target_level: Option<usize>,
    ) -> Result<Vec<ScoreItem>> {
        self.validate_intent(intent)?;
        if self.store.num_capabilities() == 0 {
            return Ok(Vec::new());
        }
        let pass = self.forward()?;
        let params = self.params.as_ref().expect("params exist after forward");
        let intent = DVector::from_column_slice(intent);
        Ok(scorer::rank(&self.store, &pass, params, &intent, target_level))
    }

    /// One online gradient step.
    ///
    /// An unknown target drops the example with a diagnostic and returns
    /// `Ok(None)`; numerical failures abort the step with parameters
    /// untouched.
    pub fn train_on_example(
        &mut self,
        intent: &[f32],
        target_id: &str,
        outcome: u8,
    ) -> Result<Option<TrainResult>> {
        self.validate_intent(intent)?;
        let Some(target_cap) = self.store.capability_idx(target_id) else {
            debug!(target = %target_id, "dropping training example for unknown capability");
            return Ok(None);
        };

        let pass = self.forward()?;
        let params = self.params.as_mut().expect("params exist after forward");
        let intent = DVector::from_column_slice(intent);
        let result = trainer::train_step(
            &self.store,
            params,
            &pass,
            &intent,
            target_cap,
            outcome as f32,
            self.config.learning_rate,
            self.config.l2_lambda,
            self.config.gradient_warn_norm,
        )?;
        Ok(Some(result))
    }

    pub fn export_params(&mut self) -> Result<Vec<u8>> {
        self.ensure_params();
        Ok(blob::export_params(
            self.params.as_ref().expect("params were just ensured"),
        ))
    }

    pub fn import_params(&mut self, bytes: &[u8]) -> Result<()> {
        let imported = blob::import_params(bytes)?;
        if imported.embedding_dim != self.config.embedding_dim {
            return Err(Error::DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: imported.embedding_dim,
            });
        }
        if let Some(heads) = self.config.num_heads {
            if imported.num_heads != heads {
                return Err(Error::DimensionMismatch {
                    expected: heads,
                    actual: imported.num_heads,
                });
            }
        }
        if imported.levels.len() < self.store.num_levels() {
            return Err(Error::DimensionMismatch {
                expected: self.store.num_levels(),
                actual: imported.levels.len(),
            });
        }
        self.params = Some(imported);
        Ok(())
    }

    pub fn parameter_count(&mut self) -> usize {
        self.ensure_params();
        self.params
            .as_ref()
            .map(|p| p.parameter_count())
            .unwrap_or(0)
    }

    fn validate_intent(&self, intent: &[f32]) -> Result<()> {
        if intent.is_empty() {
            return Err(Error::EmptyInput("intent embedding".to_string()));
        }
        if intent.len() != self.config.embedding_dim {
            return Err(Error::DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: intent.len(),
            });
        }
        if !intent.iter().all(|v| v.is_finite()) {
            return Err(Error::NonFiniteInput("intent embedding".to_string()));
        }
        Ok(())
    }

    /// Materialize parameters, freezing the head count on first use
    fn ensure_params(&mut self) {
        if self.params.is_none() {
            let num_heads = self.config.num_heads.unwrap_or_else(|| {
                adaptive_head_count(
                    self.store.num_tools(),
                    self.store.num_capabilities(),
                    self.store.max_level(),
                )
            });
            debug!(num_heads, head_dim = self.config.head_dim, "initializing parameters");
            self.params = Some(NetworkParams::init(
                &mut self.rng,
                self.config.embedding_dim,
                num_heads,
                self.config.head_dim,
            ));
        }
        let num_levels = self.store.num_levels();
        let params = self.params.as_mut().expect("params were just created");
        params.ensure_levels(&mut self.rng, num_levels);
    }

    /// Keep level parameters aligned with the inhabited levels
    fn sync_level_params(&mut self) {
        if let Some(params) = self.params.as_mut() {
            params.release_levels_above(self.store.num_levels());
            params.ensure_levels(&mut self.rng, self.store.num_levels());
        }
    }
}

/// Exclusive-lock handle for hosts with many request handlers.
///
/// All mutating passes hold the lock for their full duration; readers of
/// previously returned results need nothing.
#[derive(Clone)]
pub struct SharedEngine {
    inner: Arc<Mutex<ShgatEngine>>,
}

impl SharedEngine {
    pub fn new(engine: ShgatEngine) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ShgatEngine> {
        self.inner.lock()
    }
}
