//! Out-of-process batch-training worker
//!
//! Reads one framed training request from stdin, runs the prioritized
//! replay loop, and writes one framed reply to stdout. All diagnostics go
//! to stderr so stdout carries nothing but the protocol frame. Exit codes:
//! 0 success, 1 protocol failure, 2 training failure.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shgat_core::protocol::{self, TrainingRequest};

#[derive(Parser, Debug)]
#[command(name = "shgat-trainer", about = "SHGAT batch training worker")]
struct Args {
    /// Log filter, e.g. "info" or "shgat_core=debug"
    #[arg(long, default_value = "info", env = "SHGAT_TRAINER_LOG")]
    log_level: String,

    /// Override the number of gradient steps from the request
    #[arg(long)]
    steps: Option<usize>,
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .with_writer(std::io::stderr)
        .init();

    let mut request: TrainingRequest = {
        let stdin = std::io::stdin();
        match protocol::read_frame(&mut stdin.lock()) {
            Ok(request) => request,
            Err(err) => {
                error!(error = %err, "failed to read the training request");
                std::process::exit(1);
            }
        }
    };
    if let Some(steps) = args.steps {
        request.config.training.steps = steps;
    }

    info!(
        tools = request.graph.tools.len(),
        capabilities = request.graph.capabilities.len(),
        examples = request.examples.len(),
        steps = request.config.training.steps,
        "starting batch training"
    );

    let reply = match protocol::run_batch(&request) {
        Ok(reply) => reply,
        Err(err) => {
            error!(error = %err, "batch training failed");
            std::process::exit(2);
        }
    };

    info!(
        final_loss = reply.final_loss,
        final_accuracy = reply.final_accuracy,
        "batch training finished"
    );

    let stdout = std::io::stdout();
    if let Err(err) = protocol::write_frame(&mut stdout.lock(), &reply) {
        error!(error = %err, "failed to write the training reply");
        std::process::exit(1);
    }
}
