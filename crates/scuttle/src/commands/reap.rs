//! Reap command implementation
//!
//! Manual reclamation for runs whose reaper never got the chance: force-removes
//! every container labelled with the session, the sidecar included.

use super::{resolve_session, runtime_from_config};
use anyhow::{bail, Result};
use scuttle_core::errors::{RuntimeError, ScuttleError};
use scuttle_core::labels::LabelFilter;
use scuttle_core::observability::short_id;
use scuttle_core::runtime::{RemoveOptions, RuntimeClient};
use scuttle_core::session::SessionId;
use tracing::{info, instrument, warn};

/// Reap command arguments
#[derive(Debug, Clone)]
pub struct ReapArgs {
    /// Session to reclaim instead of the current one
    pub session: Option<String>,
    /// Only list what would be removed
    pub dry_run: bool,
}

/// Outcome of one reclamation pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

#[instrument(skip(args))]
pub async fn execute_reap(args: ReapArgs) -> Result<()> {
    let session = resolve_session(args.session);
    let runtime = runtime_from_config()?;

    let summary = reap_session(runtime.as_ref(), &session, args.dry_run).await?;
    let verb = if args.dry_run { "Would remove" } else { "Removed" };
    for id in &summary.removed {
        println!("{} {}", verb, short_id(id));
    }
    println!(
        "{} {} container(s) of session {}",
        verb,
        summary.removed.len(),
        session.short()
    );

    if !summary.failed.is_empty() {
        bail!(
            "Failed to remove {} container(s): {}",
            summary.failed.len(),
            summary.failed.join(", ")
        );
    }
    Ok(())
}

/// Force-remove every container labelled with `session`
pub async fn reap_session(
    runtime: &dyn RuntimeClient,
    session: &SessionId,
    dry_run: bool,
) -> scuttle_core::Result<ReapSummary> {
    let containers = runtime.list_containers(&LabelFilter::session(session)).await?;
    let mut summary = ReapSummary::default();

    for container in containers {
        if dry_run {
            summary.removed.push(container.id);
            continue;
        }
        let result = runtime
            .remove_container(
                &container.id,
                RemoveOptions {
                    force: true,
                    volumes: true,
                },
            )
            .await;
        match result {
            // Already gone, e.g. auto-removed after the reaper stopped it
            Ok(()) | Err(ScuttleError::Runtime(RuntimeError::ContainerNotFound { .. })) => {
                info!(container_id = %short_id(&container.id), "Removed container");
                summary.removed.push(container.id);
            }
            Err(error) => {
                warn!(container_id = %short_id(&container.id), %error, "Could not remove container");
                summary.failed.push(container.id);
            }
        }
    }

    Ok(summary)
}
