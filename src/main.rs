use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use apkwright::config::ServerConfig;
use apkwright::db::Db;
use apkwright::server;

#[derive(Parser)]
#[command(name = "apkwright")]
#[command(version, about = "Android web-asset repack and Gradle release build server")]
struct Cli {
    /// Data directory (database, snapshots, upload staging)
    #[arg(long, global = true, default_value = ".apkwright")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the build server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3456")]
        port: u16,

        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Initialize the database and data directories without serving
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "apkwright=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::with_data_dir(cli.data_dir);

    match cli.command {
        Commands::Serve { port, dev } => {
            config.port = port;
            config.dev_mode = dev;
            server::start_server(config).await
        }
        Commands::InitDb => {
            config.ensure_directories()?;
            Db::new(&config.db_path)?;
            println!("Initialized data directory at {}", config.data_dir.display());
            Ok(())
        }
    }
}
