//! Framed subprocess protocol for out-of-process batch training
//!
//! One length-prefixed bincode request flows to the worker's stdin, one
//! length-prefixed reply comes back on stdout. Everything else (logs,
//! structured errors) belongs on stderr. The parent interprets the reply
//! atomically or not at all.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::{EngineConfig, TrainingConfig};
use crate::engine::ShgatEngine;
use crate::graph::{GraphStore, Member};
use crate::replay::{ReplayBuffer, TrainingExample};
use crate::{Error, Result};

/// Upper bound on a single frame; anything larger is a protocol violation
const MAX_FRAME_LEN: u32 = 512 * 1024 * 1024;

/// Worker-side configuration bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

/// Plain-serde tool record for shipping a graph across the process boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: String,
    pub embedding: Vec<f32>,
}

/// Plain-serde capability record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub members: Vec<Member>,
    pub success_rate: f32,
}

/// A complete graph in insertion order, rebuildable on the other side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub tools: Vec<ToolRecord>,
    pub capabilities: Vec<CapabilityRecord>,
}

impl GraphSnapshot {
    pub fn from_store(store: &GraphStore) -> Self {
        Self {
            tools: store
                .tools()
                .iter()
                .map(|t| ToolRecord {
                    id: t.id.clone(),
                    embedding: t.embedding.iter().copied().collect(),
                })
                .collect(),
            capabilities: store
                .capabilities()
                .iter()
                .map(|c| CapabilityRecord {
                    id: c.id.clone(),
                    embedding: c.embedding.iter().copied().collect(),
                    members: c.members.clone(),
                    success_rate: c.success_rate,
                })
                .collect(),
        }
    }
}

/// Batch-training request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub config: WorkerConfig,
    pub graph: GraphSnapshot,
    /// Starting parameters; absent means fresh initialization
    pub parameters: Option<Vec<u8>>,
    pub examples: Vec<TrainingExample>,
}

/// Batch-training reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReply {
    /// Updated parameter blob
    pub parameters: Vec<u8>,
    /// Final priority per input example, in request order
    pub td_errors: Vec<f32>,
    pub final_loss: f32,
    pub final_accuracy: f32,
}

/// Rebuild an engine from a snapshot.
///
/// Snapshot order is insertion order, so members always precede the
/// capabilities that reference them.
pub fn engine_from_snapshot(config: EngineConfig, graph: &GraphSnapshot) -> Result<ShgatEngine> {
    let mut engine = ShgatEngine::new(config)?;
    for tool in &graph.tools {
        engine.insert_tool(&tool.id, tool.embedding.clone())?;
    }
    for cap in &graph.capabilities {
        engine.insert_capability(
            &cap.id,
            cap.embedding.clone(),
            cap.members.clone(),
            cap.success_rate,
        )?;
    }
    Ok(engine)
}

/// Run the batch-training loop; shared by the worker binary and tests
pub fn run_batch(request: &TrainingRequest) -> Result<TrainingReply> {
    if request.examples.is_empty() {
        return Err(Error::EmptyInput("training examples".to_string()));
    }
    let training = &request.config.training;
    let mut engine = engine_from_snapshot(request.config.engine.clone(), &request.graph)?;
    if let Some(parameters) = &request.parameters {
        engine.import_params(parameters)?;
    }

    let mut buffer = ReplayBuffer::from_examples(
        request.examples.clone(),
        training.replay_alpha,
        training.min_priority,
    );
    // Replay sampling gets its own deterministic stream, decoupled from the
    // engine's initialization stream
    let mut rng = StdRng::seed_from_u64(request.config.engine.seed.wrapping_add(1));

    let window = request.examples.len().max(1);
    let mut recent_losses: VecDeque<f32> = VecDeque::with_capacity(window);
    let mut recent_accuracy: VecDeque<f32> = VecDeque::with_capacity(window);

    for step in 0..training.steps {
        let index = buffer.sample(&mut rng).expect("buffer is non-empty");
        let example = buffer.examples()[index].clone();
        match engine.train_on_example(&example.intent, &example.target, example.outcome)? {
            Some(result) => {
                let td_error = (result.predicted - example.outcome as f32).abs();
                buffer.update_priority(index, td_error);
                if recent_losses.len() == window {
                    recent_losses.pop_front();
                    recent_accuracy.pop_front();
                }
                recent_losses.push_back(result.loss);
                recent_accuracy.push_back(result.accuracy);
                debug!(step, loss = result.loss, td_error, "batch step");
            }
            None => {
                warn!(target = %example.target, "example references an unknown capability");
                buffer.update_priority(index, 0.0);
            }
        }
    }

    let mean = |values: &VecDeque<f32>| {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f32>() / values.len() as f32
        }
    };

    Ok(TrainingReply {
        parameters: engine.export_params()?,
        td_errors: buffer.priorities(),
        final_loss: mean(&recent_losses),
        final_accuracy: mean(&recent_accuracy),
    })
}

/// Write one framed message to a synchronous writer
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let payload = bincode::serialize(value).map_err(|e| Error::Protocol(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Protocol("frame exceeds u32 length".to_string()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message from a synchronous reader
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {} bytes is too large", len)));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    bincode::deserialize(&payload).map_err(|e| Error::Protocol(e.to_string()))
}

/// Spawn the worker binary, submit one request, and await the reply under a
/// deadline. The worker is killed on expiry and partial output is discarded.
pub async fn run_training_worker(
    worker_command: &str,
    worker_args: &[String],
    request: &TrainingRequest,
    deadline: Duration,
) -> Result<TrainingReply> {
    let payload = bincode::serialize(request).map_err(|e| Error::Protocol(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Protocol("frame exceeds u32 length".to_string()))?;

    let mut child = tokio::process::Command::new(worker_command)
        .args(worker_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let mut stdout = child.stdout.take().expect("stdout was piped");

    let exchange = async {
        stdin.write_all(&len.to_le_bytes()).await?;
        stdin.write_all(&payload).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let mut len_bytes = [0u8; 4];
        stdout.read_exact(&mut len_bytes).await?;
        let reply_len = u32::from_le_bytes(len_bytes);
        if reply_len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "reply frame of {} bytes is too large",
                reply_len
            )));
        }
        let mut reply_payload = vec![0u8; reply_len as usize];
        stdout.read_exact(&mut reply_payload).await?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::Worker(format!("worker exited with {}", status)));
        }
        bincode::deserialize::<TrainingReply>(&reply_payload)
            .map_err(|e| Error::Protocol(e.to_string()))
    };

    match tokio::time::timeout(deadline, exchange).await {
        Ok(reply) => reply,
        Err(_) => Err(Error::Worker(format!(
            "worker exceeded the {:?} deadline and was killed",
            deadline
        ))),
    }
}
