mod cron;
mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{Method, Request, StatusCode, header},
};
use diffcast_capabilities::Capabilities;
use diffcast_core::config::Config;
use diffcast_db::{Database, Records};
use diffcast_github::{GitHub, ingest::Ingestor};
use diffcast_jobs::{JobContext, JobStorage, create_monitor, recover_pipeline_runs};
use diffcast_pipeline::Orchestrator;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    cors::{self, CorsLayer},
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    records: Records,
    orchestrator: Orchestrator,
    ingestor: Ingestor,
    github: Arc<GitHub>,
    jobs: Arc<JobStorage>,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = {
        let path = std::env::var("DIFFCAST_CONFIG").unwrap_or_else(|_| "config.yml".to_string());
        let file = BufReader::new(File::open(&path).expect("Failed to open config file"));
        Arc::new(serde_yaml::from_reader::<_, Config>(file).expect("Failed to parse config file"))
    };
    let db = Database::new(&config.db).await.expect("Failed to open database");
    let records = Records::new(Arc::new(db.clone()));
    let github = GitHub::new(&config.github).await.expect("Failed to create GitHub client");
    let caps = Capabilities::from_config(&config).expect("Failed to set up capabilities");
    let ingestor = Ingestor::new(github.clone(), records.clone(), caps.summarizer.clone());
    let orchestrator = Orchestrator::new(records.clone(), caps, config.pipeline.clone());

    // Create the job storage and monitor
    let jobs = JobStorage::setup(&config.db).await.expect("Failed to set up job storage");
    let job_context = JobContext { config: config.clone(), orchestrator: orchestrator.clone() };
    let monitor = create_monitor(jobs.clone(), job_context.clone(), &config.worker)
        .expect("Failed to create job monitor");
    let state = AppState {
        config: config.clone(),
        records,
        orchestrator,
        ingestor,
        github,
        jobs: jobs.clone(),
    };

    // Resume everything left queued or running by the previous process
    recover_pipeline_runs(&job_context, &jobs, true)
        .await
        .expect("Failed to recover pipeline runs");

    // Start the task scheduler
    let mut scheduler =
        cron::create(job_context, jobs).await.expect("Failed to create scheduler");

    // Build the router
    let port = state.config.server.port;
    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    tracing::info!("Web server: Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("bind error");

    // Run both the web server and job monitor concurrently, with graceful shutdown
    let web_server = async {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Web server error");
        tracing::info!("Web server stopped");
        result
    };
    let job_monitor = async {
        let result =
            monitor.run_with_signal(shutdown_signal_io()).await.context("Job monitor error");
        tracing::info!("Job monitor stopped");
        result
    };

    // Wait for both to complete gracefully (early return on error)
    if let Err(e) = tokio::try_join!(web_server, job_monitor) {
        tracing::error!("{e}");
    }

    scheduler.shutdown().await.expect("Failed to shut down scheduler");
    db.close().await;
    tracing::info!("Shut down gracefully");
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> = vec![
        header::AUTHORIZATION,
        header::COOKIE,
        header::HeaderName::from_static("x-hub-signature-256"),
    ]
    .into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MyMakeSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(120),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash())
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::PUT])
                .allow_headers([header::CONTENT_TYPE])
                .allow_origin(cors::Any),
        )
        .compression();
    let media_dir = state.config.pipeline.media_dir.clone();
    build_router(&media_dir).with_state(state).layer(middleware)
}

async fn shutdown_signal() {
    if let Err(e) = shutdown_signal_io().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Shutdown signal that returns io::Result for the job monitor.
async fn shutdown_signal_io() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

#[derive(Debug, Clone)]
pub struct MyMakeSpan {
    level: Level,
}

impl<B> MakeSpan<B> for MyMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let forwarded_for = request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next());
        let ip = if let Some(v) = forwarded_for {
            IpAddr::from_str(v.trim()).ok()
        } else if let Some(ConnectInfo(socket_addr)) =
            request.extensions().get::<ConnectInfo<SocketAddr>>()
        {
            Some(socket_addr.ip())
        } else {
            None
        };
        let ip = ip.unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[unknown]");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    user_agent = %user_agent,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
