use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use chrono::{DateTime, Utc};
use miramail_core::{
    Config, LlmReplyGenerator, ReplyPrompt, RespondStats, Responder, ResponderStatus, SendMode,
    gmail::{ClientSecrets, FileTokenStore, GmailClient, Mailbox, load_or_authorize},
    init_telemetry,
    llm::GenaiLLMClient,
    run_responder,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    send_mode: SendMode,
    status: Arc<RwLock<ResponderStatus>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let secrets = ClientSecrets::from_file(&config.gmail.credentials_file)?;
    let token_store = Arc::new(FileTokenStore::new(&config.gmail.token_file));
    let tokens = load_or_authorize(&secrets, &token_store, &config.gmail.scopes).await?;

    let client = GmailClient::new(
        reqwest::Client::new(),
        config.gmail.user_id.clone(),
        secrets.client_id.clone(),
        secrets.client_secret.clone(),
        tokens,
        token_store,
    )
    .with_token_endpoint(secrets.token_uri.clone());
    let mailbox = Mailbox::new(client).with_fetch_concurrency(config.gmail.fetch_concurrency);
    let responder = Responder::new(mailbox, config.responder.send_mode)
        .with_query(config.responder.query.clone());

    let generator = Arc::new(
        LlmReplyGenerator::new(GenaiLLMClient::new(&config.model))
            .with_prompt(ReplyPrompt::from_model_config(&config.model)),
    );

    let status = Arc::new(RwLock::new(ResponderStatus::default()));
    let shutdown = CancellationToken::new();
    let responder_handle = tokio::spawn(run_responder(
        responder,
        generator,
        Duration::from_secs(config.responder.poll_interval_secs),
        shutdown.child_token(),
        status.clone(),
    ));
    let supervisor = tokio::spawn(supervise_responder(
        responder_handle,
        status.clone(),
        shutdown.clone(),
    ));

    let state = AppState {
        send_mode: config.responder.send_mode,
        status,
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("miramail listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    supervisor.await??;
    Ok(())
}

/// Waits for the responder task. A panic degrades health and stops the server.
async fn supervise_responder(
    handle: JoinHandle<()>,
    status: Arc<RwLock<ResponderStatus>>,
    shutdown: CancellationToken,
) -> Result<(), JoinError> {
    let result = handle.await;
    if let Err(err) = &result {
        error!(error = %err, "responder task failed");
        status.write().await.last_error = Some(format!("responder task failed: {err}"));
        shutdown.cancel();
    }
    result
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    send_mode: SendMode,
    passes: u64,
    last_pass_at: Option<DateTime<Utc>>,
    last_stats: Option<RespondStats>,
    last_error: Option<String>,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let status = state.status.read().await.clone();
    let (code, label) = if status.last_error.is_some() {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        code,
        Json(HealthResponse {
            status: label.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            send_mode: state.send_mode,
            passes: status.passes,
            last_pass_at: status.last_pass_at,
            last_stats: status.last_stats,
            last_error: status.last_error,
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}
