// Chatvend daemon: load config, wire the engine, run the four loops
// (Telegram bridge, AI worker pool, schedulers, payment callback server)
// until SIGINT/SIGTERM, then drain with a grace window.

use clap::Parser;
use log::{error, info, warn};
use std::io::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatvend::atoms::config::{AppConfig, LogFormat};
use chatvend::atoms::constants::SHUTDOWN_GRACE_SECS;
use chatvend::engine::callback;
use chatvend::engine::scheduler::Scheduler;
use chatvend::engine::state::EngineState;
use chatvend::engine::telegram;
use chatvend::engine::worker::AiJobWorker;

#[derive(Parser, Debug)]
#[command(author, version, about = "Telegram bot selling credit-metered LLM chat")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "CHATVEND_CONFIG", default_value = "chatvend.toml")]
    config: String,
}

fn init_logging(config: &AppConfig) {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&config.log.level);
    if config.log.format == LogFormat::Json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339(),
                "level": record.level().to_string(),
                "target": record.target(),
                "msg": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    }
    builder.init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chatvend: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(&config);
    info!("[main] Starting chatvend (config {})", args.config);

    let schedule = match cron::Schedule::from_str(&config.scheduler.expiry_check_cron) {
        Ok(s) => s,
        Err(e) => {
            // Validation already checked this; double parse keeps the
            // type local.
            error!("[main] Bad cron expression: {}", e);
            std::process::exit(1);
        }
    };

    let state = match EngineState::init(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("[main] Engine init failed: {}", e);
            std::process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    // Telegram long-poll bridge (inbound).
    handles.push(telegram::spawn_polling(state.clone(), stop.clone()));

    // AI job worker pool (bounded further by the LLM semaphore).
    let worker = Arc::new(AiJobWorker::new(
        state.store.clone(),
        state.users.clone(),
        state.plans.clone(),
        state.pricing.clone(),
        state.llm.clone(),
        state.telegram.clone(),
        state.crypto.clone(),
        state.metrics.clone(),
    ));
    handles.extend(worker.spawn_pool(state.config.ai.concurrent_limit, stop.clone()));

    // Expiry sweep + payment reconciler.
    let scheduler = Arc::new(Scheduler::new(
        state.store.clone(),
        state.subscriptions.clone(),
        state.payments.clone(),
        state.telegram.clone(),
        schedule,
    ));
    handles.extend(scheduler.spawn(stop.clone()));

    // Gateway redirect callback + /metrics.
    handles.push(callback::spawn_server(state.clone(), stop.clone()));

    shutdown_signal().await;
    info!("[main] Shutdown requested, draining");
    stop.store(true, Ordering::Relaxed);

    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), drain).await.is_err() {
        warn!("[main] Grace window elapsed with work still in flight");
    }
    info!("[main] Bye");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => return tokio::signal::ctrl_c().await.map(|_| ()).unwrap_or(()),
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
