#![allow(clippy::multiple_crate_versions)]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ots_calendar::aggregator::Aggregator;
use ots_calendar::backup::Backup;
use ots_calendar::calendar::Calendar;
use ots_calendar::cli::ServerCli;
use ots_calendar::config::Config;
use ots_calendar::error::{ServerError, ServerResult};
use ots_calendar::mirror::Mirror;
use ots_calendar::server::{self, AppState};
use ots_calendar::stamper::{BitcoinCoreRpc, Stamper};

#[tokio::main]
async fn main() -> ServerResult<()> {
    env_logger::init();

    let cli = ServerCli::parse();
    let config = load_config(&cli)?;

    log::info!("opening calendar at {}", config.datadir.display());
    let calendar = Calendar::open(&config.datadir, &config.uri)?;
    let store = calendar.store_handle();

    let backup_cache_dir = if config.backup_cache_dir.is_absolute() {
        config.backup_cache_dir.clone()
    } else {
        config.datadir.join(&config.backup_cache_dir)
    };
    let backup = Arc::new(Backup::new(&calendar, backup_cache_dir)?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (aggregator, stamper_handle) = if cli.mirror_of.is_empty() {
        let aggregator = Aggregator::spawn(calendar, config.aggregator.commitment_interval());

        let auth = if config.bitcoin.rpc_user.is_empty() {
            bitcoincore_rpc::Auth::None
        } else {
            bitcoincore_rpc::Auth::UserPass(
                config.bitcoin.rpc_user.clone(),
                config.bitcoin.rpc_password.clone(),
            )
        };
        let rpc = Arc::new(BitcoinCoreRpc::new(&config.bitcoin.rpc_url, auth)?);
        let stamper_calendar =
            Calendar::open_with_store(&config.datadir, &config.uri, store.clone())?;
        let stamper = Stamper::new(stamper_calendar, rpc, config.stamper.to_runtime());
        let handle = stamper.spawn(config.stamper.poll_interval(), shutdown_rx.clone());
        (Some(aggregator), Some(handle))
    } else {
        // a pure mirror runs no aggregator or stamper of its own; `calendar`
        // was only needed to open the store, already captured in `store`
        log::info!("running as a mirror of {} remote(s)", cli.mirror_of.len());
        let _ = calendar;
        spawn_mirrors(&cli.mirror_of, store.clone(), shutdown_rx.clone());
        (None, None)
    };

    let state = AppState::new(config.uri.clone(), aggregator, store, backup, stamper_handle);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    log::info!("listening on {}", config.bind);

    let server = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown_signal(shutdown_tx));
    server.await?;
    Ok(())
}

fn load_config(cli: &ServerCli) -> Result<Config, ServerError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(datadir) = &cli.datadir {
        config.datadir = datadir.clone();
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(uri) = &cli.uri {
        config.uri = uri.clone();
    }
    if let Some(url) = &cli.bitcoin_rpc_url {
        config.bitcoin.rpc_url = url.clone();
    }
    if let Some(user) = &cli.bitcoin_rpc_user {
        config.bitcoin.rpc_user = user.clone();
    }
    if let Some(password) = &cli.bitcoin_rpc_password {
        config.bitcoin.rpc_password = password.clone();
    }
    Ok(config)
}

/// Spawn one background sync loop per mirrored remote, each resuming from
/// chunk 0 and polling every remote's `timeout` as its retry spacing.
fn spawn_mirrors(
    remotes: &[String],
    store: ots_calendar::calendar_store::CalendarStore,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    for remote in remotes {
        let remote = remote.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let mirror = match Mirror::new(remote.clone(), store, Duration::from_secs(30)) {
                Ok(mirror) => mirror,
                Err(err) => {
                    log::error!("failed to build mirror for {remote}: {err}");
                    return;
                }
            };
            let mut next_chunk = 0;
            loop {
                if *shutdown.borrow() {
                    return;
                }
                match mirror.sync_from(next_chunk).await {
                    Ok(chunk) => next_chunk = chunk,
                    Err(err) => log::warn!("mirror sync from {remote} failed: {err}"),
                }
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(60)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

async fn wait_for_shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutdown signal received, draining in-flight work");
    let _ = shutdown_tx.send(true);
}
