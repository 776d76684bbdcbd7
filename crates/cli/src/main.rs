mod commands;
mod config;
mod logging;
mod tables;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use commands::migrate;
use config::ProjectConfig;
use logging::{LogFormat, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "migrate")]
#[command(about = "Apply and roll back sequential schema migrations")]
#[command(version)]
struct Cli {
    /// Project configuration file (optional)
    #[arg(long, global = true, default_value = "migrate.yaml")]
    config: PathBuf,

    /// Database URL, overriding the configuration file and environment
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Apply every pending migration
    Up,

    /// Revert the most recently applied migrations
    Down {
        /// Number of migrations to revert
        #[arg(default_value_t = 1)]
        n: usize,
    },

    /// Show applied and pending migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the highest applied migration identifier
    Version,

    /// Create a new SQL migration file
    Create {
        /// Migration name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init_logging(LoggingConfig::for_cli(cli.log_format, cli.verbose))?;
    let project = ProjectConfig::load_or_default(&cli.config)?;
    let database_url = cli.database_url.as_deref();

    match cli.command {
        Commands::Up => migrate::up(&project, database_url).await?,
        Commands::Down { n } => migrate::down(&project, database_url, n).await?,
        Commands::Status { json } => migrate::status(&project, database_url, json).await?,
        Commands::Version => migrate::version(&project, database_url).await?,
        Commands::Create { name } => migrate::create(&project, &name)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_down_defaults_to_one() {
        let cli = Cli::try_parse_from(["migrate", "down"]).unwrap();
        assert_eq!(cli.command, Commands::Down { n: 1 });

        let cli = Cli::try_parse_from(["migrate", "down", "3"]).unwrap();
        assert_eq!(cli.command, Commands::Down { n: 3 });
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "migrate",
            "status",
            "--json",
            "--database-url",
            "sqlite://fleet.db",
            "--log-format",
            "json",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.command, Commands::Status { json: true });
        assert_eq!(cli.database_url.as_deref(), Some("sqlite://fleet.db"));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, PathBuf::from("migrate.yaml"));
    }

    #[test]
    fn test_create_requires_a_name() {
        assert!(Cli::try_parse_from(["migrate", "create"]).is_err());
        let cli = Cli::try_parse_from(["migrate", "create", "add_shell_to_users"]).unwrap();
        assert_eq!(cli.command, Commands::Create { name: "add_shell_to_users".to_string() });
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["migrate", "up", "--log-format", "xml"]).is_err());
    }
}
