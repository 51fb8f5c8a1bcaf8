use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use query_distributed::DefaultExchangeClientSupplier;
use query_server::{LocalQueryManager, QueryRegistry, Session};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod demo;

use config::Config;
use demo::{build_executor, run_demo, NumbersQuery};

#[derive(Parser)]
#[command(name = "qe")]
#[command(author, version, about = "Query Engine - fault-tolerant distributed query execution", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the statement result resource over HTTP
    Serve {
        /// Address to bind to (overrides the configuration)
        #[arg(short, long)]
        bind: Option<String>,

        /// Directory for snapshots (overrides the configuration)
        #[arg(short, long)]
        snapshot_dir: Option<PathBuf>,

        /// Submit a numbers query of this many rows at startup
        #[arg(long)]
        numbers: Option<u64>,

        /// Source partitions of the startup query
        #[arg(short, long, default_value = "4")]
        partitions: u32,
    },

    /// Run a numbers query in-process and print its result pages
    Demo {
        /// Rows to generate
        #[arg(short, long, default_value = "100000")]
        rows: u64,

        /// Source partitions
        #[arg(short, long, default_value = "4")]
        partitions: u32,

        /// Rows per generated batch
        #[arg(long, default_value = "1000")]
        batch_rows: u64,

        /// Kill a source task after this many milliseconds to exercise recovery
        #[arg(short, long)]
        kill_after_ms: Option<u64>,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output file
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = if let Some(config_path) = cli.config {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };

    print_banner();

    match cli.command {
        Commands::Serve {
            bind,
            snapshot_dir,
            numbers,
            partitions,
        } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server = config.server.with_bind_address(bind);
            }
            if snapshot_dir.is_some() {
                config.snapshot_dir = snapshot_dir;
            }
            serve(config, numbers, partitions).await?;
        }
        Commands::Demo {
            rows,
            partitions,
            batch_rows,
            kill_after_ms,
        } => {
            let query = NumbersQuery {
                rows,
                partitions,
                batch_rows,
            };
            run_demo(config, query, kill_after_ms.map(Duration::from_millis)).await?;
        }
        Commands::InitConfig { output } => {
            config.save(&output)?;
            println!("{} {}", "wrote".bright_green(), output.display());
        }
    }

    Ok(())
}

async fn serve(config: Config, numbers: Option<u64>, partitions: u32) -> Result<()> {
    let executor = build_executor(&config)?;
    let shutdown = CancellationToken::new();
    let checkpointing = executor.start_checkpointing(shutdown.clone());

    let retention = Duration::from_millis(config.server.query_retention_ms);
    let manager = Arc::new(LocalQueryManager::new(executor.clone(), retention));
    let registry = QueryRegistry::new(
        manager.clone(),
        Arc::new(DefaultExchangeClientSupplier::default()),
        config.server.clone(),
    );

    let expiry = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_millis(config.server.purge_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = manager.expire();
                        if expired > 0 {
                            tracing::debug!("Expired {} queries", expired);
                        }
                    }
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    let address = listener.local_addr()?;

    if let Some(rows) = numbers {
        let query = NumbersQuery {
            rows,
            partitions,
            batch_rows: 1000,
        };
        let (query_id, slug) = manager.submit(query.plan()?, Session::new("cli"))?;
        println!(
            "{} http://{}/v1/statement/executing/{}/{}/0",
            "results:".bright_green(),
            address,
            query_id,
            slug
        );
    }

    let server = tokio::spawn(query_server::serve(
        listener,
        registry.clone(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.cancel();
    server.await??;
    let _ = expiry.await;
    if let Some(handle) = checkpointing {
        let _ = handle.await;
    }
    registry.stop().await;
    executor.shutdown().await;
    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        "qe=debug,query_core=debug,query_executor=debug,query_distributed=debug,query_server=debug"
    } else {
        "qe=info,query_distributed=info,query_server=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
   ___                          _____            _
  / _ \ _   _  ___ _ __ _   _  | ____|_ __   __ _(_)_ __   ___
 | | | | | | |/ _ \ '__| | | | |  _| | '_ \ / _` | | '_ \ / _ \
 | |_| | |_| |  __/ |  | |_| | | |___| | | | (_| | | | | |  __/
  \__\_\\__,_|\___|_|   \__, | |_____|_| |_|\__, |_|_| |_|\___|
                        |___/               |___/
    "#
        .bright_cyan()
    );
    println!(
        "{}",
        "Fault-Tolerant Distributed Query Engine v0.1.0".bright_yellow()
    );
    println!("{}", "Press Ctrl-C to stop\n".bright_black());
}
