//! Collaborator seams for persistence
//!
//! The engine itself never talks to storage; a host wires these traits to
//! its key/value store and trace pipeline.

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::replay::TrainingExample;
use crate::Result;

/// Persistence for trained parameter blobs
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Load the last saved blob, if any
    async fn load_params(&self) -> Result<Option<Vec<u8>>>;

    /// Persist a blob, replacing any previous one
    async fn save_params(&self, blob: &[u8]) -> Result<()>;
}

/// Persistence for training examples with priorities
#[async_trait]
pub trait ExampleStore: Send + Sync {
    /// Fetch up to `k` examples, biased towards high priority
    async fn fetch_priority_sample(&self, k: usize) -> Result<Vec<TrainingExample>>;

    /// Write back updated priorities after a training round
    async fn update_priorities(&self, updates: &[(Uuid, f32)]) -> Result<()>;
}

/// In-memory parameter store for tests and single-process hosts
#[derive(Default)]
pub struct MemoryParameterStore {
    blob: Mutex<Option<Vec<u8>>>,
}

#[async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn load_params(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().clone())
    }

    async fn save_params(&self, blob: &[u8]) -> Result<()> {
        *self.blob.lock() = Some(blob.to_vec());
        Ok(())
    }
}

/// In-memory example store backed by a sorted vector
#[derive(Default)]
pub struct MemoryExampleStore {
    examples: Mutex<Vec<TrainingExample>>,
}

impl MemoryExampleStore {
    pub fn push(&self, example: TrainingExample) {
        self.examples.lock().push(example);
    }
}

#[async_trait]
impl ExampleStore for MemoryExampleStore {
    async fn fetch_priority_sample(&self, k: usize) -> Result<Vec<TrainingExample>> {
        let mut examples = self.examples.lock().clone();
        examples.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        examples.truncate(k);
        Ok(examples)
    }

    async fn update_priorities(&self, updates: &[(Uuid, f32)]) -> Result<()> {
        let mut examples = self.examples.lock();
        for (id, priority) in updates {
            if let Some(example) = examples.iter_mut().find(|e| e.id == *id) {
                example.priority = *priority;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_parameter_store_round_trip() {
        let store = MemoryParameterStore::default();
        assert!(store.load_params().await.unwrap().is_none());
        store.save_params(&[1, 2, 3]).await.unwrap();
        assert_eq!(store.load_params().await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_memory_example_store_orders_by_priority() {
        let store = MemoryExampleStore::default();
        let mut low = TrainingExample::new(vec![0.0], "a", 0);
        low.priority = 0.1;
        let mut high = TrainingExample::new(vec![0.0], "b", 1);
        high.priority = 0.9;
        store.push(low);
        store.push(high.clone());

        let sample = store.fetch_priority_sample(1).await.unwrap();
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].target, "b");

        store.update_priorities(&[(high.id, 0.01)]).await.unwrap();
        let sample = store.fetch_priority_sample(1).await.unwrap();
        assert_eq!(sample[0].target, "a");
    }
}
