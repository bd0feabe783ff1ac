//! Axum gateway for the Chino voice assistant. Config-driven via `CoreConfig`
//! (`config/chino.toml` + `CHINO__*` env); voice settings come from `CHINO_VOICE_*`.

mod api;
#[cfg(feature = "voice")]
mod voice;

use std::net::SocketAddr;
#[cfg(feature = "voice")]
use std::sync::Arc;

use chino_core::{CoreConfig, CoreRegistry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{build_app, AppState};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    #[allow(unused_mut)]
    let mut config = match CoreConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(target: "chino::gateway", error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    #[cfg(feature = "voice")]
    let voice_config = if voice::enabled() { voice::load_config() } else { None };
    #[cfg(feature = "voice")]
    if voice_config.is_some() {
        // lane workers complete sentences; the router must not do it itself
        config.router.passthrough = false;
    }

    let registry = match CoreRegistry::builder(config.clone()).build() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(target: "chino::gateway", error = %e, "failed to build core registry");
            std::process::exit(1);
        }
    };
    registry.dialog().start_watchdog();

    #[allow(unused_mut)]
    let mut app = build_app(AppState::new(registry.clone()));

    #[cfg(feature = "voice")]
    let voice_runtime = match voice_config {
        Some(vc) => match voice::VoiceRuntime::start(&registry, vc).await {
            Ok(runtime) => Some(Arc::new(runtime)),
            Err(e) => {
                tracing::warn!(target: "chino::gateway", error = %e, "voice runtime failed to start; replies will not be voiced");
                None
            }
        },
        None => None,
    };
    #[cfg(feature = "voice")]
    if let Some(runtime) = &voice_runtime {
        app = app.merge(voice::routes(Arc::clone(runtime)));
    }

    let addr: SocketAddr = match config.bind_addr().parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(target: "chino::gateway", host = %config.host, port = config.port, error = %e, "invalid listen address");
            std::process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(target: "chino::gateway", %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(target: "chino::gateway", app = %config.app_name, %addr, "🌐 listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(target: "chino::gateway", error = %e, "ctrl-c handler failed");
        }
        tracing::info!(target: "chino::gateway", "shutdown initiated (Ctrl+C received)");
    });
    if let Err(e) = server.await {
        tracing::error!(target: "chino::gateway", error = %e, "server error");
    }

    #[cfg(feature = "voice")]
    if let Some(runtime) = &voice_runtime {
        runtime.stop().await;
    }
    registry.shutdown().await;
    tracing::info!(target: "chino::gateway", "✓ graceful shutdown complete");
}
