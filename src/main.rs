//! Watch containers for newer images and update them in place.
mod cli;

use crate::cli::{Action, configure_cli};
use docksentinel::Sentinel;
use docksentinel::config::{Config, load_config};
use docksentinel::outbound::docker::DockerRuntime;
use docksentinel::outbound::sqlite::Sqlite;
use env_logger::Env;
use log::{error, info, warn};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + 'static>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = configure_cli();
    let config = load_config(&cli.config)?;

    #[cfg(target_os = "linux")]
    set_group_id(config.docker_gid);

    let sentinel = build(&config).await?;

    match cli.action {
        Action::Check(name) => {
            let result = sentinel.check_update(&name).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Action::ScanOnce(mode) => {
            sentinel.recover(config.stale_after()).await?;
            let report = sentinel.scan_and_enqueue(mode, None).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            let processed = sentinel.drain_queue().await;
            info!("scan finished, {processed} queued jobs processed");
        }
        Action::Daemon => run_daemon(&sentinel, &config).await?,
    }
    Ok(())
}

async fn build(
    config: &Config,
) -> Result<Sentinel<DockerRuntime, Sqlite>, Box<dyn std::error::Error>> {
    let runtime = DockerRuntime::connect()?;
    let store = Sqlite::new(&config.database_url)
        .await?
        .with_claim_attempts(config.worker.claim_attempts);
    store.migrate().await?;
    Ok(Sentinel::new(runtime, store, config.sentinel_options()))
}

async fn run_daemon(
    sentinel: &Sentinel<DockerRuntime, Sqlite>,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting docksentinel");
    let recovered = sentinel.recover(config.stale_after()).await?;
    if recovered > 0 {
        warn!("requeued {recovered} jobs left running by a previous process");
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, gracefully shutting down...");
        let _ = shutdown_tx.send(true);
    })?;

    sentinel.start().await?;
    if shutdown_rx.changed().await.is_err() {
        error!("shutdown signal handler went away");
    }
    sentinel.shutdown();
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_group_id(gid: Option<u32>) {
    let Some(gid) = gid else {
        return;
    };
    info!("Setting GID to {gid}");
    // requires CAP_SETGID
    unsafe {
        if libc::setgid(gid) != 0 {
            error!("Failed to set GID to {gid}");
        }
    }
}
