use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex;

use hotcolumn::backfill::AbortRegistry;
use hotcolumn::config::PipelineConfig;
use hotcolumn::cycle;
use hotcolumn::database::{self, ClickHouseOps, DatabaseOps};
use hotcolumn::ranker::StaticSavingsModel;
use hotcolumn::server::{self, AppState};
use hotcolumn::state::StateStore;

/// HotColumn - automatic materialized columns for ClickHouse
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Pipeline configuration YAML file; environment variables are used when omitted
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Run one cycle and exit (for external schedulers like cron)
    #[arg(long)]
    run_once: bool,

    /// HTTP server host address
    #[arg(long, default_value = "0.0.0.0")]
    http_host: String,

    /// HTTP server port
    #[arg(long, default_value_t = 8080)]
    http_port: u16,

    /// Hours between scheduled cycles (default: weekly)
    #[arg(long, default_value_t = 168, value_parser = clap::value_parser!(u64).range(1..))]
    interval_hours: u64,
}

#[tokio::main]
async fn main() {
    // Initialize logger - defaults to INFO level, can be overridden with RUST_LOG env var
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    println!("\nHotColumn v{}\n", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path),
        None => PipelineConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let client = database::get_client();
    let ops: Arc<dyn DatabaseOps> = Arc::new(ClickHouseOps::new(
        client,
        Duration::from_secs(config.op_timeout_secs),
    ));

    let store = match StateStore::open(&config.state_path) {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(e) => {
            eprintln!("State store error: {}", e);
            std::process::exit(1);
        }
    };
    let aborts = Arc::new(AbortRegistry::default());
    let model = StaticSavingsModel {
        factor: config.savings_factor,
    };

    if cli.run_once {
        match cycle::run_cycle(ops, store, aborts, &config, &model).await {
            Ok(report) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).expect("report serializes")
                );
            }
            Err(e) => {
                eprintln!("Cycle failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Scheduled mode: interval loop plus the ops HTTP surface
    let scheduler_state = AppState {
        ops: ops.clone(),
        store: store.clone(),
        aborts: aborts.clone(),
        config: config.clone(),
    };

    let interval_hours = cli.interval_hours;
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(interval_hours * 3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let model = StaticSavingsModel {
                factor: scheduler_state.config.savings_factor,
            };
            match cycle::run_cycle(
                scheduler_state.ops.clone(),
                scheduler_state.store.clone(),
                scheduler_state.aborts.clone(),
                &scheduler_state.config,
                &model,
            )
            .await
            {
                Ok(report) => log::info!("Scheduled cycle finished: {:?}", report),
                Err(e) => log::error!("Scheduled cycle failed: {}", e),
            }
        }
    });

    let state = AppState {
        ops,
        store,
        aborts,
        config,
    };
    if let Err(e) = server::serve(state, &cli.http_host, cli.http_port).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
