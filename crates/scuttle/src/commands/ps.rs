//! Ps command implementation
//!
//! Lists containers carrying the scuttle labels, for the current session by default.

use super::{resolve_session, runtime_from_config};
use crate::cli::OutputFormat;
use anyhow::{Context, Result};
use console::style;
use scuttle_core::labels::{LabelFilter, LABEL_BASE, LABEL_REAPER, LABEL_SESSION_ID};
use scuttle_core::observability::short_id;
use scuttle_core::runtime::ContainerInfo;
use tracing::{debug, instrument};

/// Ps command arguments
#[derive(Debug, Clone)]
pub struct PsArgs {
    /// List every session
    pub all_sessions: bool,
    /// Session to list instead of the current one
    pub session: Option<String>,
    pub output: OutputFormat,
}

/// Label filter selecting the containers to list
pub(crate) fn filter_for(args: &PsArgs) -> LabelFilter {
    if args.all_sessions {
        LabelFilter::new().with(LABEL_BASE, "true")
    } else {
        LabelFilter::session(&resolve_session(args.session.clone()))
    }
}

#[instrument(skip(args))]
pub async fn execute_ps(args: PsArgs) -> Result<()> {
    let filter = filter_for(&args);
    debug!(%filter, "Listing containers");

    let runtime = runtime_from_config()?;
    let mut containers = runtime.list_containers(&filter).await?;
    containers.sort_by(|a, b| a.names.cmp(&b.names));

    match args.output {
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&containers)
                .context("Failed to serialize container list")?;
            println!("{}", rendered);
        }
        OutputFormat::Text => print_table(&containers),
    }
    Ok(())
}

fn print_table(containers: &[ContainerInfo]) {
    if containers.is_empty() {
        println!("{}", style("No containers found").dim());
        return;
    }

    println!(
        "{:<14} {:<28} {:<10} {:<14} {}",
        "CONTAINER", "NAME", "STATE", "SESSION", "IMAGE"
    );
    for container in containers {
        let state = match container.state.as_str() {
            "running" => style(container.state.as_str()).green(),
            "exited" | "dead" => style(container.state.as_str()).red(),
            _ => style(container.state.as_str()).yellow(),
        };
        let session = container
            .labels
            .get(LABEL_SESSION_ID)
            .map(|s| s.get(..12).unwrap_or(s))
            .unwrap_or("-");
        let mut name = container.names.join(",");
        if container.labels.contains_key(LABEL_REAPER) {
            name.push_str(" (reaper)");
        }
        println!(
            "{:<14} {:<28} {:<10} {:<14} {}",
            short_id(&container.id),
            name,
            state,
            session,
            container.image
        );
    }
}
