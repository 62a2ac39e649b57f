//! Logs command implementation
//!
//! Follows a container's output through the log producer until Ctrl-C.

use super::{resolve_session, runtime_from_config};
use anyhow::{anyhow, Context, Result};
use scuttle_core::logs::{LogConsumer, LogKind, LogProductionOptions, LogRecord};
use scuttle_core::LifecycleController;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Logs command arguments
#[derive(Debug, Clone)]
pub struct LogsArgs {
    /// Container id or name
    pub container: String,
}

/// Writes each record to the matching terminal stream
struct TerminalConsumer;

impl LogConsumer for TerminalConsumer {
    fn accept(&self, record: &LogRecord) {
        // Broken pipes (e.g. `| head`) just drop output
        let _ = match record.kind {
            LogKind::Stdout => std::io::stdout().lock().write_all(&record.content),
            LogKind::Stderr => std::io::stderr().lock().write_all(&record.content),
        };
    }
}

#[instrument(skip(args), fields(container = %args.container))]
pub async fn execute_logs(args: LogsArgs) -> Result<()> {
    let runtime = runtime_from_config()?;
    let info = runtime
        .inspect_container(&args.container)
        .await?
        .ok_or_else(|| anyhow!("No such container: {}", args.container))?;

    let controller = LifecycleController::new(runtime, resolve_session(None));
    let container = controller.adopt(&info);

    container
        .start_log_production(
            vec![Arc::new(TerminalConsumer) as Arc<dyn LogConsumer>],
            LogProductionOptions::default(),
        )
        .await?;
    debug!("Log production started, waiting for Ctrl-C or end of stream");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            container.stop_log_production().await?;
        }
        ended = container.wait_log_production() => {
            ended.context("Log stream failed")?;
            debug!("Log stream ended");
        }
    }
    Ok(())
}
