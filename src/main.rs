mod affinity;
mod codec;
mod config;
mod dispatch;
mod ingress;
mod instructions;
mod realtime;
mod session;
mod store;
mod telephony;
mod turn;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use config::Config;
use dispatch::calendar::CalendarClient;
use dispatch::knowledge_base::KnowledgeBaseClient;
use session::SessionDeps;
use store::Store;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub knowledge_base: Arc<KnowledgeBaseClient>,
    pub calendar: Arc<CalendarClient>,
}

impl AppState {
    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            store: Arc::clone(&self.store),
            knowledge_base: Arc::clone(&self.knowledge_base),
            calendar: Arc::clone(&self.calendar),
            config: Arc::clone(&self.config),
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("voice-bridge {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("voice-bridge {VERSION}");
    println!("Telephony-to-realtime-LLM voice bridge for Twilio and the OpenAI Realtime API");
    println!();
    println!("Usage: voice-bridge [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the bridge server.");
}

async fn server() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=info,tower_http=info".into()),
        )
        .init();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        instance_id = %config.server.instance_id,
        "Starting voice-bridge"
    );

    let config = Arc::new(config);

    let state = AppState {
        store: Arc::new(Store::new(&config.store)),
        knowledge_base: Arc::new(KnowledgeBaseClient::new(config.store.base_url.clone())),
        calendar: Arc::new(CalendarClient::new(config.calendar.base_url.clone(), config.calendar.access_token.clone())),
        config: Arc::clone(&config),
    };

    let instance_id = config.server.instance_id.clone();
    let affinity_layer = axum::middleware::from_fn(move |req, next| {
        let instance_id = instance_id.clone();
        async move { affinity::route_by_affinity(&instance_id, req, next).await }
    });

    // Affinity only guards the media-stream upgrade — that's the only route
    // whose handler depends on in-process Session state.
    let media_stream_routes = Router::new()
        .route("/conversation/{agent_id}/media-stream/{instance_id}", get(handle_media_stream_upgrade))
        .layer(affinity_layer);

    let app = Router::new()
        .route("/voice", post(ingress::handle_voice))
        .route("/health", get(health))
        .merge(media_stream_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid server address");

    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}

/// Path segments exist for the affinity router, not for call context — the
/// real per-call identity arrives in the `start` envelope's custom
/// parameters, since the carrier strips query strings from this URL.
async fn handle_media_stream_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((_agent_id, _instance_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let deps = state.session_deps();
    ws.on_upgrade(move |socket| session::run(socket, deps))
}

async fn health() -> &'static str {
    "ok"
}
