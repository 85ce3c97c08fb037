mod api;
mod clock;
mod config;
mod dispatch;
mod errors;
mod health;
mod limits;
mod provider;
mod router;
mod state;
mod ui;
mod usage;

use anyhow::Result;
use axum::{routing::post, Router};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use reqwest::Client;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{error, info};

use clock::SystemClock;
use config::{Config, Settings};
use health::HealthController;
use state::AppState;
use usage::CounterStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_target(true)
        .compact()
        .init();

    let settings = Settings::from_env();
    let cfg = if settings.config_path.exists() {
        Config::load_from_path(&settings.config_path)?
    } else {
        info!(
            "no config at {:?}, starting with an empty catalog",
            settings.config_path
        );
        Config::default()
    };
    info!(
        providers = cfg.providers.len(),
        virtual_providers = cfg.virtual_providers.len(),
        limits = cfg.limits.len(),
        "loaded configuration"
    );

    // State
    let clk: Arc<dyn clock::Clock> = Arc::new(SystemClock);
    let counters = Arc::new(CounterStore::load(&settings.usage_path, clk.clone()));
    let health_ctl = Arc::new(HealthController::new(clk));
    let client = Client::builder()
        .pool_max_idle_per_host(32)
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .build()?;

    let app_state = Arc::new(AppState::new(
        settings.clone(),
        cfg,
        counters,
        health_ctl,
        client,
    )?);

    // Health probes
    {
        let state = app_state.clone();
        tokio::spawn(async move {
            health::probe_loop(state).await;
        });
    }

    // Usage snapshot writer
    {
        let state = app_state.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(state.settings.persist_interval_s)).await;
                if let Err(e) = state.counters.persist(&state.settings.usage_path) {
                    error!("failed to persist usage snapshot: {:?}", e);
                }
            }
        });
    }

    // Config watcher
    {
        let state = app_state.clone();
        let cfg_path = settings.config_path.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_config_and_apply(cfg_path, state).await {
                error!("config watcher error: {:?}", e);
            }
        });
    }

    // Terminal dashboard (enabled by default; set MRELAY_TUI=0 to disable)
    if settings.tui {
        let state = app_state.clone();
        tokio::spawn(async move {
            ui::run_terminal_dashboard(state).await;
        });
    }

    // HTTP server
    let addr: SocketAddr = format!("{}:{}", settings.bind_addr, settings.port).parse()?;
    let router = Router::new()
        .route("/v1/chat/completions", post(dispatch::chat_completions))
        .route(
            "/:provider/v1/chat/completions",
            post(dispatch::chat_completions_for),
        )
        .merge(api::router())
        .with_state(app_state.clone());

    info!("listening on http://{}", addr);
    let listener = TcpListener::bind(addr).await?;
    let shutdown_state = app_state.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("shutting down, flushing usage snapshot");
            if let Err(e) = shutdown_state
                .counters
                .persist(&shutdown_state.settings.usage_path)
            {
                error!("failed to flush usage snapshot: {:?}", e);
            }
        })
        .await?;
    Ok(())
}

async fn watch_config_and_apply(cfg_path: PathBuf, state: Arc<AppState>) -> Result<()> {
    use tokio::sync::mpsc;
    let (tx, mut rx) = mpsc::channel::<()>(8);

    let cfg_file = cfg_path.file_name().map(|f| f.to_os_string());
    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(ev) = res {
                // The snapshot writer shares this directory; only the config
                // file itself triggers a reload.
                let ours = ev
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|f| Some(f.to_os_string()) == cfg_file).unwrap_or(false));
                if !ours {
                    return;
                }
                match ev.kind {
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {
                        let _ = tx.try_send(());
                    }
                    _ => {}
                }
            }
        },
        notify::Config::default(),
    )?;

    let watch_dir = cfg_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;

    loop {
        rx.recv().await;
        match Config::load_from_path(&cfg_path) {
            Ok(new_cfg) => match state.apply_config(new_cfg) {
                Ok(()) => info!("applied new config (hot reload)"),
                Err(e) => error!("rejected new config: {:?}", e),
            },
            Err(e) => {
                error!("failed to reload config: {:?}", e);
            }
        }
    }
}
