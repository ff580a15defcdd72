use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use rally_api::{AppState, AppStateInner};
use rally_db::Database;
use rally_gateway::connection;
use rally_gateway::dispatcher::Dispatcher;

#[derive(Clone)]
struct GatewayState {
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("RALLY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("RALLY_DB_PATH").unwrap_or_else(|_| "rally.db".into());
    let host = std::env::var("RALLY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("RALLY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        dispatcher: dispatcher.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    let gateway_state = GatewayState {
        dispatcher,
        db,
        jwt_secret,
    };

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    let app = rally_api::router(app_state)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Rally messaging server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.db, state.jwt_secret)
    })
}
