//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Flowbox - sandboxed flow-step execution
///
/// Runs engine operations in a fixed pool of isolation slots backed by a
/// shared dependency cache.
#[derive(Parser, Debug)]
#[command(name = "flowbox")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "FLOWBOX_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one operation in a sandbox slot
    Run(RunArgs),

    /// Show backend, package manager and pool status
    Status(StatusArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),

    /// Manage dependency caches
    Cache(CacheArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Operation payload file (JSON); `-` reads stdin
    pub operation: PathBuf,

    /// Operation type
    #[arg(short = 't', long = "type", value_enum, default_value = "execute-flow")]
    pub operation_type: OperationKind,

    /// Registry package needed by the operation (name@version, repeatable)
    #[arg(short, long = "piece", value_name = "NAME@VERSION")]
    pub pieces: Vec<String>,

    /// Archive package from the blob store (name@version#archive-id, repeatable)
    #[arg(long = "archive", value_name = "NAME@VERSION#ID")]
    pub archives: Vec<String>,

    /// Inline code step identifier (repeatable)
    #[arg(long = "code-step", value_name = "ID")]
    pub code_steps: Vec<String>,

    /// Wall-clock deadline in milliseconds (default: from config)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Pretty-print the outcome JSON
    #[arg(long)]
    pub pretty: bool,
}

/// Operation types accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperationKind {
    ExecuteFlow,
    ExecuteStep,
    ExecuteTriggerHook,
    ExecuteProperty,
    ExecuteValidateAuth,
    ExtractPieceMetadata,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for list-style commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cache entries on disk
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove old and abandoned cache entries
    Gc {
        /// Remove entries older than N days (default: from config)
        #[arg(long)]
        days: Option<u32>,

        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every cache entry and downloaded archive
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run() {
        let cli = Cli::parse_from([
            "flowbox",
            "run",
            "op.json",
            "--type",
            "execute-step",
            "--piece",
            "@flowbox/piece-http@0.3.0",
            "--archive",
            "@acme/piece-custom@1.0.0#arch_1",
            "--code-step",
            "step_2",
            "--timeout-ms",
            "500",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.operation, PathBuf::from("op.json"));
                assert_eq!(args.operation_type, OperationKind::ExecuteStep);
                assert_eq!(args.pieces, vec!["@flowbox/piece-http@0.3.0"]);
                assert_eq!(args.archives, vec!["@acme/piece-custom@1.0.0#arch_1"]);
                assert_eq!(args.code_steps, vec!["step_2"]);
                assert_eq!(args.timeout_ms, Some(500));
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn run_defaults_to_execute_flow() {
        let cli = Cli::parse_from(["flowbox", "run", "-"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.operation_type, OperationKind::ExecuteFlow);
                assert!(args.pieces.is_empty());
                assert!(args.timeout_ms.is_none());
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_cache_gc() {
        let cli = Cli::parse_from(["flowbox", "cache", "gc", "--days", "7", "--dry-run"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Gc { days, dry_run },
            }) => {
                assert_eq!(days, Some(7));
                assert!(dry_run);
            }
            _ => panic!("expected cache gc"),
        }
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::parse_from(["flowbox", "status"]);
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["flowbox", "-vv", "status"]);
        assert_eq!(cli.verbose, 2);
    }
}
