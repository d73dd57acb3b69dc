use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kurabak::app::{self, Engine};
use kurabak::config::{default_config_path, ResolvedConfig};
use kurabak::prices::AssetClass;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kurabak")]
#[command(about = "Currency, gold and silver price refresher")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Show current configuration
    Config,

    /// Refresh prices once and print the outcomes
    Refresh {
        /// Only refresh this class (currency, gold or silver)
        #[arg(long)]
        class: Option<AssetClass>,
    },

    /// Print the stored latest values of a class
    Latest {
        class: AssetClass,
    },

    /// Print stored history of one asset
    History {
        class: AssetClass,
        code: String,

        /// Number of newest points to show
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .json(),
        )
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = ResolvedConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Command::Config) => {
            print_json(&app::config_output(&config_path, &config))?;
        }
        Some(Command::Refresh { class }) => {
            let engine = Engine::from_config(config)?;
            let output = app::refresh_once(&engine, class).await;
            print_json(&output)?;
            if output.outcomes.iter().all(|o| !o.succeeded) {
                anyhow::bail!("every refresh failed");
            }
        }
        Some(Command::Latest { class }) => {
            let engine = Engine::from_config(config)?;
            print_json(&app::latest_values(&engine, class).await?)?;
        }
        Some(Command::History { class, code, limit }) => {
            let engine = Engine::from_config(config)?;
            print_json(&app::history(&engine, class, &code, limit).await?)?;
        }
        None => {
            println!("KuraBak - currency, gold and silver prices");
            println!("==========================================\n");
            println!("Config: {}", config_path.display());
            println!("Data directory: {}\n", config.data_dir.display());
            println!("Commands:");
            println!("  config     Show current configuration");
            println!("  refresh    Refresh prices once");
            println!("  latest     Show stored latest values of a class");
            println!("  history    Show stored history of an asset\n");
            println!("Run 'kurabak --help' for more options.");
        }
    }

    Ok(())
}
