//! CLI command definitions using clap.
//!
//! - run: host the scheduler until Ctrl-C
//! - status: show the last persisted snapshot, or one service's status log
//! - history: list archived tasks
//! - cleanup: apply the retention window
//! - submit: run one task through the scheduler and print its result

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use resumr::domain::{Priority, TaskStatus};

/// Resumr - a rate-limit-aware task scheduler
#[derive(Parser, Debug)]
#[command(name = "resumr")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub log_stderr: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler in the foreground until Ctrl-C
    Run,

    /// Show services and queued tasks from the last saved state
    Status {
        /// Print raw JSON
        #[arg(long)]
        json: bool,

        /// Show the recorded status changes of one service instead
        #[arg(long)]
        service: Option<String>,
    },

    /// List archived tasks, newest first
    History {
        /// Filter by status (completed, failed)
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Filter by service id
        #[arg(long)]
        service: Option<String>,

        /// Maximum number of records
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete history and service snapshots past the retention window
    Cleanup {
        /// Override the configured retention in days
        #[arg(short, long)]
        days: Option<u64>,
    },

    /// Enqueue one task and wait for its result
    Submit {
        /// Target service id (anthropic, github, realtime)
        service: String,

        /// Task payload as JSON, e.g. '{"type":"source_control","endpoint":"/user"}'
        payload: String,

        /// Priority (critical, high, normal, low)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Give up waiting after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Attach to a live task submitted with the same key
        #[arg(short, long)]
        key: Option<String>,

        /// Key the task by its service and payload
        #[arg(long, conflicts_with = "key")]
        dedupe: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["resumr"]).is_err());
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from(["resumr", "-v", "--log-stderr", "-c", "/etc/resumr.yml", "run"]).unwrap();
        assert!(cli.is_verbose());
        assert!(cli.log_stderr);
        assert_eq!(cli.config.as_ref(), Some(&PathBuf::from("/etc/resumr.yml")));
        assert!(matches!(cli.command, Commands::Run));
    }

    #[test]
    fn test_status_json() {
        let cli = Cli::try_parse_from(["resumr", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: true, service: None }));
    }

    #[test]
    fn test_status_service_log() {
        let cli = Cli::try_parse_from(["resumr", "status", "--service", "anthropic"]).unwrap();
        match cli.command {
            Commands::Status { json, service } => {
                assert!(!json);
                assert_eq!(service.as_deref(), Some("anthropic"));
            }
            _ => panic!("Expected status command"),
        }
    }

    #[test]
    fn test_history_filters() {
        let cli = Cli::try_parse_from(["resumr", "history", "-s", "failed", "--service", "github", "-l", "5"]).unwrap();
        match cli.command {
            Commands::History { status, service, limit } => {
                assert_eq!(status, Some(TaskStatus::Failed));
                assert_eq!(service.as_deref(), Some("github"));
                assert_eq!(limit, 5);
            }
            _ => panic!("Expected history command"),
        }
    }

    #[test]
    fn test_history_rejects_unknown_status() {
        assert!(Cli::try_parse_from(["resumr", "history", "-s", "sleeping"]).is_err());
    }

    #[test]
    fn test_cleanup_days() {
        let cli = Cli::try_parse_from(["resumr", "cleanup", "--days", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Cleanup { days: Some(3) }));
    }

    #[test]
    fn test_submit_defaults() {
        let cli = Cli::try_parse_from(["resumr", "submit", "github", r#"{"type":"source_control","endpoint":"/user"}"#])
            .unwrap();
        match cli.command {
            Commands::Submit {
                service,
                payload,
                priority,
                timeout,
                key,
                dedupe,
            } => {
                assert_eq!(service, "github");
                assert!(payload.contains("source_control"));
                assert_eq!(priority, Priority::Normal);
                assert!(timeout.is_none());
                assert!(key.is_none());
                assert!(!dedupe);
            }
            _ => panic!("Expected submit command"),
        }
    }

    #[test]
    fn test_submit_priority() {
        let cli = Cli::try_parse_from(["resumr", "submit", "anthropic", "{}", "-p", "critical", "-t", "30"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Submit {
                priority: Priority::Critical,
                timeout: Some(30),
                ..
            }
        ));
    }

    #[test]
    fn test_submit_key_and_dedupe_conflict() {
        let cli = Cli::try_parse_from(["resumr", "submit", "github", "{}", "-k", "issue-42"]).unwrap();
        assert!(matches!(cli.command, Commands::Submit { key: Some(ref k), .. } if k == "issue-42"));
        assert!(Cli::try_parse_from(["resumr", "submit", "github", "{}", "-k", "a", "--dedupe"]).is_err());
    }

    #[test]
    fn test_help_works() {
        Cli::command().debug_assert();
    }
}
