use crate::commands::{self, logs::LogsArgs, ps::PsArgs, reap::ReapArgs};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// scuttle subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the session id of this process tree
    Session,

    /// Print the effective configuration as JSON
    Config,

    /// List containers labelled by scuttle
    Ps {
        /// Include containers of every session, not just the current one
        #[arg(long)]
        all_sessions: bool,

        /// Session to list instead of the current one
        #[arg(long, value_name = "ID", conflicts_with = "all_sessions")]
        session: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Force-remove every container of a session, reaper included
    Reap {
        /// Session to reclaim instead of the current one
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        /// Only list what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Follow a container's logs until Ctrl-C
    Logs {
        /// Container id or name
        container: String,
    },
}

#[derive(Debug, Parser)]
#[command(
    name = "scuttle",
    version,
    about = "Disposable test container toolkit",
    long_about = "Disposable test container toolkit\n\nInspects and reclaims the containers created by scuttle test sessions.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via SCUTTLE_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None, // Let logging module check environment variable
        };

        // Set environment variable for log level before initializing logging
        if std::env::var_os("SCUTTLE_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            let level = self.log_level.as_str();
            std::env::set_var("RUST_LOG", format!("scuttle={},scuttle_core={}", level, level));
        }
        scuttle_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", self.log_level.as_str());

        match self.command {
            Commands::Session => commands::session::execute_session(),
            Commands::Config => commands::config::execute_config(),
            Commands::Ps {
                all_sessions,
                session,
                output,
            } => {
                commands::ps::execute_ps(PsArgs {
                    all_sessions,
                    session,
                    output,
                })
                .await
            }
            Commands::Reap { session, dry_run } => {
                commands::reap::execute_reap(ReapArgs { session, dry_run }).await
            }
            Commands::Logs { container } => {
                commands::logs::execute_logs(LogsArgs { container }).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ps_flags() {
        let cli = Cli::parse_from(["scuttle", "ps", "--all-sessions", "--output", "json"]);
        match cli.command {
            Commands::Ps {
                all_sessions,
                session,
                output,
            } => {
                assert!(all_sessions);
                assert!(session.is_none());
                assert_eq!(output, OutputFormat::Json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_ps_session_conflicts_with_all_sessions() {
        let result =
            Cli::try_parse_from(["scuttle", "ps", "--all-sessions", "--session", "abc"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_log_flags_after_subcommand() {
        let cli = Cli::parse_from(["scuttle", "session", "--log-format", "json"]);
        assert!(matches!(cli.log_format, Some(LogFormat::Json)));
        assert!(matches!(cli.command, Commands::Session));
    }
}
