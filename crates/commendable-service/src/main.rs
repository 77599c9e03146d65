use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use commendable_api::{
    config::DEFAULT_QUEUE_CAPACITY, receive_datagrams, CommendableApi, EngineConfig, Ingestor,
    RefreshScheduler,
};
use commendable_core::{MemoryStore, Message, OrderedStore, RecommendationsRequest};
use commendable_store_sqlite::SqliteStore;
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: CommendableApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "commendable-service")]
#[command(about = "Event ingestion and recommendation query service")]
struct Args {
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    ip: IpAddr,
    /// Port receiving ingestion datagrams.
    #[arg(long, default_value_t = 29191)]
    udp_port: u16,
    /// Port serving JSON queries.
    #[arg(long, default_value_t = 29192)]
    json_port: u16,
    #[arg(long, default_value = "./commendable.sqlite3")]
    db: PathBuf,
    /// Keep all state in process memory instead of `--db`.
    #[arg(long)]
    in_memory: bool,
    /// Days views and activations stay alive after the last activity.
    #[arg(long, default_value_t = 14)]
    activation_timeout: u32,
    #[arg(long, default_value_t = 1)]
    workers: usize,
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreLocation {
    Sqlite(PathBuf),
    InMemory,
}

/// Process settings, fixed once arguments are parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServiceConfig {
    udp_addr: SocketAddr,
    http_addr: SocketAddr,
    store: StoreLocation,
    engine: EngineConfig,
}

impl From<Args> for ServiceConfig {
    fn from(args: Args) -> Self {
        let store =
            if args.in_memory { StoreLocation::InMemory } else { StoreLocation::Sqlite(args.db) };
        Self {
            udp_addr: SocketAddr::new(args.ip, args.udp_port),
            http_addr: SocketAddr::new(args.ip, args.json_port),
            store,
            engine: EngineConfig {
                workers: args.workers,
                queue_capacity: args.queue_capacity,
                ..EngineConfig::default()
            }
            .with_retention_days(args.activation_timeout),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(err: &anyhow::Error) -> ServiceError {
        tracing::error!(error = format!("{err:#}"), "query failed");
        ServiceError { error: format!("{err:#}") }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/openapi", get(openapi))
        .route("/recommend/:user_id", post(recommend))
        .route("/likes/:user_id", get(likes))
        .route("/views/:user_id", get(views))
        .route("/actives", get(actives))
        .with_state(state)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

fn open_store(location: &StoreLocation) -> Result<Arc<dyn OrderedStore>> {
    match location {
        StoreLocation::InMemory => Ok(Arc::new(MemoryStore::new())),
        StoreLocation::Sqlite(path) => {
            let store = SqliteStore::open(path)?;
            store.migrate().with_context(|| format!("failed to migrate {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ServiceConfig::from(Args::parse());

    let store = open_store(&config.store)?;
    let api = CommendableApi::new(store, config.engine);

    let socket = UdpSocket::bind(config.udp_addr)
        .await
        .with_context(|| format!("failed to bind udp listener on {}", config.udp_addr))?;
    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind http listener on {}", config.http_addr))?;

    let ingestor = Ingestor::new(api.clone());
    let _workers = ingestor.spawn_workers(config.engine.workers);
    tokio::spawn(async move {
        if let Err(err) = receive_datagrams(socket, ingestor).await {
            tracing::error!(error = format!("{err:#}"), "datagram receiver stopped");
        }
    });
    tokio::spawn(RefreshScheduler::new(api.clone()).run());

    tracing::info!(
        udp = %config.udp_addr,
        http = %config.http_addr,
        store = ?config.store,
        "commendable service listening"
    );
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn recommend(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    Json(request): Json<RecommendationsRequest>,
) -> Result<Json<Vec<Message>>, ServiceError> {
    let api = state.api.clone();
    let result = tokio::task::spawn_blocking(move || api.recommend(&user_id, &request))
        .await
        .context("recommend task panicked")
        .and_then(|result| result)
        .map_err(|err| ServiceState::error(&err))?;
    Ok(Json(result))
}

async fn likes(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Message>>, ServiceError> {
    let result = state.api.likes(&user_id).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(result))
}

async fn views(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Message>>, ServiceError> {
    let result = state.api.views(&user_id).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(result))
}

async fn actives(State(state): State<ServiceState>) -> Result<Json<Vec<Message>>, ServiceError> {
    let result = state.api.actives().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(result))
}
