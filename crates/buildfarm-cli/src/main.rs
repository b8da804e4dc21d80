//! Build farm CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "buildfarm")]
#[command(about = "Distributed build farm agent and controls", long_about = None)]
struct Cli {
    /// Agent configuration file
    #[arg(long, env = "BUILDFARM_CONFIG", default_value = "buildfarm.kdl", global = true)]
    config: PathBuf,

    /// Work store connection string, overriding the configuration file
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run this machine as a build agent
    Agent {
        /// Machine name, overriding the configuration file
        #[arg(long, env = "BUILDFARM_MACHINE")]
        machine: Option<String>,
    },
    /// Check a build script for illegal lines
    Validate {
        /// Path to the script file
        script: PathBuf,
        /// Branch the script is interpreted for
        #[arg(long, default_value = "Main")]
        branch: String,
    },
    /// Trigger a build request
    Trigger {
        /// Build request description
        description: String,
        /// Operator recorded on the build
        #[arg(long, env = "USER", default_value = "LocalUser")]
        operator: String,
    },
    /// Kill a running build
    Kill {
        /// Build request description
        description: String,
        /// Who asked for the kill
        #[arg(long, env = "USER", default_value = "LocalUser")]
        killer: String,
    },
    /// Ask an agent to restart once idle
    Restart {
        /// Machine name
        machine: String,
    },
    /// List agent records
    Agents {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Apply work store migrations
    Migrate,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let db = commands::StoreOptions {
        config: cli.config.clone(),
        database_url: cli.database_url.clone(),
    };

    match cli.command {
        Commands::Agent { machine } => {
            let reason = commands::agent::run(&cli.config, machine, cli.database_url).await?;
            std::process::exit(commands::agent::exit_code(reason));
        }
        Commands::Validate { script, branch } => {
            commands::validate::validate(&script, &branch)?;
        }
        Commands::Trigger { description, operator } => {
            commands::requests::trigger(&db, &description, &operator).await?;
        }
        Commands::Kill { description, killer } => {
            commands::requests::kill(&db, &description, &killer).await?;
        }
        Commands::Restart { machine } => {
            commands::requests::restart(&db, &machine).await?;
        }
        Commands::Agents { json } => {
            commands::requests::agents(&db, json).await?;
        }
        Commands::Migrate => {
            commands::migrate(&db).await?;
        }
    }

    Ok(())
}
