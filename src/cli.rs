use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "request-lens", version, about = "Request capture and observation pipeline")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the demo application with the pipeline attached (default)
    Start,

    /// Test configuration file validity
    Test,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// List or delete recorded sessions
    Sessions(crate::commands::sessions::SessionsArgs),

    /// Show recent events from durable history
    Recent(crate::commands::recent::RecentArgs),

    /// Show every recorded event of one request
    Trace(crate::commands::trace::TraceArgs),

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display the effective configuration as TOML
    Show,

    /// Validate configuration file
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Start if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_start() {
        let cli = Cli {
            config: PathBuf::from("config.toml"),
            command: None,
        };

        assert!(matches!(cli.get_command(), Commands::Start));
    }

    #[test]
    fn test_cli_parsing_recent() {
        let args = vec!["request-lens", "recent", "--kind", "logs", "--limit", "5", "--format", "json"];
        let cli = Cli::try_parse_from(args).unwrap();

        match cli.get_command() {
            Commands::Recent(args) => {
                assert_eq!(args.kind, "logs");
                assert_eq!(args.limit, 5);
                assert_eq!(args.format, "json");
            }
            _ => panic!("Expected Recent command"),
        }
    }

    #[test]
    fn test_cli_parsing_sessions_delete() {
        let args = vec!["request-lens", "sessions", "--delete", "abc"];
        let cli = Cli::try_parse_from(args).unwrap();

        match cli.get_command() {
            Commands::Sessions(args) => assert_eq!(args.delete.as_deref(), Some("abc")),
            _ => panic!("Expected Sessions command"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let args = vec!["request-lens", "trace", "abc", "--config", "other.toml"];
        let cli = Cli::try_parse_from(args).unwrap();

        assert_eq!(cli.config, PathBuf::from("other.toml"));
        match cli.get_command() {
            Commands::Trace(args) => assert_eq!(args.correlation_id, "abc"),
            _ => panic!("Expected Trace command"),
        }
    }
}
