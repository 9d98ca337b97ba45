mod cli;
mod pidfile;
mod shutdown;

use clap::Parser as _;
use tracing::{error, info};

use checkmill_engine::{GearmanBroker, PoolConfig, start_pool};

use crate::cli::Cli;
use crate::pidfile::PidFile;
use crate::shutdown::spawn_signal_handler;

fn init_tracing(debug_level: u8) {
    // debug_level sets the severity floor; RUST_LOG wins when present.
    let default_directive = match debug_level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let opts = match cli.into_options() {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("checkmill: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = opts.validate() {
        eprintln!("checkmill: {err}");
        std::process::exit(1);
    }

    init_tracing(opts.debug_level);

    let _pidfile = match &opts.pidfile {
        Some(path) => match PidFile::create(path) {
            Ok(guard) => Some(guard),
            Err(err) => {
                error!("{err:#}");
                std::process::exit(1);
            }
        },
        None => None,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        min_worker = opts.min_worker,
        max_worker = opts.max_worker,
        servers = %opts.servers.join(","),
        encryption = opts.encryption,
        "checkmill worker starting"
    );

    let broker = GearmanBroker::new(opts.servers.clone());
    let pool = start_pool(broker, opts, PoolConfig::default());
    spawn_signal_handler(pool.controller());

    match pool.wait().await {
        Ok(()) => info!("clean exit"),
        Err(err) => {
            error!("worker pool failed: {err:#}");
            std::process::exit(1);
        }
    }
}
