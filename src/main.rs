use std::env;

use threadline_config::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: threadline <serve|backfill> --config <path>";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" && cmd != "backfill" {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match threadline_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&cfg);

    if cmd == "backfill" {
        match threadline_server::backfill(cfg).await {
            Ok(numbered) => {
                tracing::info!(numbered, "sequence backfill complete");
                println!("numbered {numbered} message(s)");
            }
            Err(e) => {
                eprintln!("backfill failed: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        signal.cancel();
    });

    if let Err(e) = threadline_server::serve(cfg, shutdown).await {
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
