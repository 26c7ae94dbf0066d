//! Prioritized replay over stored training examples

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One stored training example
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub id: Uuid,
    pub intent: Vec<f32>,
    pub target: String,
    /// Observed outcome, 0 or 1
    pub outcome: u8,
    pub priority: f32,
    pub recorded_at: DateTime<Utc>,
}

impl TrainingExample {
    pub fn new(intent: Vec<f32>, target: &str, outcome: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent,
            target: target.to_string(),
            outcome,
            priority: 1.0,
            recorded_at: Utc::now(),
        }
    }
}

/// Replay buffer sampling examples proportionally to `priority^alpha`.
///
/// Priorities are floored at a small epsilon so every example keeps a
/// non-zero chance of being revisited.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    examples: Vec<TrainingExample>,
    alpha: f32,
    min_priority: f32,
}

impl ReplayBuffer {
    pub fn new(alpha: f32, min_priority: f32) -> Self {
        Self {
            examples: Vec::new(),
            alpha,
            min_priority,
        }
    }

    pub fn from_examples(
        examples: Vec<TrainingExample>,
        alpha: f32,
        min_priority: f32,
    ) -> Self {
        let mut buffer = Self::new(alpha, min_priority);
        for example in examples {
            buffer.push(example);
        }
        buffer
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }

    pub fn push(&mut self, mut example: TrainingExample) {
        example.priority = example.priority.max(self.min_priority);
        self.examples.push(example);
    }

    /// Sample one example index with probability proportional to
    /// `priority^alpha`
    pub fn sample(&self, rng: &mut StdRng) -> Option<usize> {
        if self.examples.is_empty() {
            return None;
        }
        let weights: Vec<f32> = self
            .examples
            .iter()
            .map(|e| e.priority.powf(self.alpha))
            .collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            return Some(0);
        }
        let mut ticket = rng.gen_range(0.0..total);
        for (i, w) in weights.iter().enumerate() {
            if ticket < *w {
                return Some(i);
            }
            ticket -= w;
        }
        Some(self.examples.len() - 1)
    }

    /// Set an example's priority to the observed TD error, floored
    pub fn update_priority(&mut self, index: usize, td_error: f32) {
        if let Some(example) = self.examples.get_mut(index) {
            example.priority = td_error.abs().max(self.min_priority);
        }
    }

    pub fn priorities(&self) -> Vec<f32> {
        self.examples.iter().map(|e| e.priority).collect()
    }
}
