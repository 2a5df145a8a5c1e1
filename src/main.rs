use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::Mutex,
    time::{Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iap_ledger::{
    clock::start_of_day, config::LedgerConfig, secrets::LedgerSecrets, util::SubscriptionUtil,
    InMemoryLedgerStore,
};

type Util = SubscriptionUtil<InMemoryLedgerStore>;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,iap_ledger=debug"));
    let use_json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn until_next_midnight() -> Duration {
    let now = Utc::now();
    let next = start_of_day(now) + chrono::Duration::days(1);
    (next - now).to_std().unwrap_or(Duration::from_secs(1))
}

/// Runs every task unless the previous tick is still going.
fn spawn_run(util: Arc<Util>, running: Arc<Mutex<()>>) {
    tokio::spawn(async move {
        let Ok(_guard) = running.try_lock_owned() else {
            warn!("previous run still in progress; skipping tick");
            return;
        };
        let started = Instant::now();
        let report = util.run_all_tasks().await;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            failures = report.failures.len(),
            "scheduler run finished"
        );
    });
}

fn spawn_midnight_reset(util: Arc<Util>, running: Arc<Mutex<()>>) {
    tokio::spawn(async move {
        let _guard = running.lock_owned().await;
        match util.reset_daily_free_credits().await {
            Ok(reset) => info!(reset, "midnight free credit reset finished"),
            Err(e) => error!(error = %e, "midnight free credit reset failed"),
        }
    });
}

/// False when the running task still held the lock after `grace`.
async fn wait_for_in_flight(running: &Mutex<()>, grace: Duration) -> bool {
    tokio::time::timeout(grace, running.lock()).await.is_ok()
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match LedgerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    let secrets = match LedgerSecrets::from_env() {
        Ok(secrets) => secrets,
        Err(e) => {
            error!(error = %e, "missing credentials");
            std::process::exit(1);
        }
    };
    let util = match Util::new(&secrets, &config).await {
        Ok(util) => Arc::new(util),
        Err(e) => {
            error!(error = %e, "failed to start ledger");
            std::process::exit(1);
        }
    };
    info!(
        interval_secs = config.scheduler_interval.as_secs(),
        "scheduler started"
    );

    let running = Arc::new(Mutex::new(()));
    let mut interval = tokio::time::interval(config.scheduler_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let midnight = tokio::time::sleep(until_next_midnight());
    tokio::pin!(midnight);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            _ = interval.tick() => spawn_run(util.clone(), running.clone()),
            _ = &mut midnight => {
                spawn_midnight_reset(util.clone(), running.clone());
                midnight.as_mut().reset(Instant::now() + until_next_midnight());
            }
        }
    }

    if !wait_for_in_flight(&running, config.shutdown_grace).await {
        warn!(
            grace_ms = config.shutdown_grace.as_millis() as u64,
            "in-flight run did not finish before shutdown, snapshot may hold a partial run"
        );
    }
    if let Err(e) = util.shutdown().await {
        error!(error = %e, "failed to close store");
    }
    info!("scheduler stopped");
}
