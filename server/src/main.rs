use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use techmeet::hub::SignalHub;
use techmeet::protocol::SignalMessage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "techmeet_signal=debug,techmeet=debug,info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(3005);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("TechMeet signaling relay listening on {}", addr);
    axum::serve(listener, router(SignalHub::new())).await?;
    Ok(())
}

fn router(hub: SignalHub) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_endpoint))
        .with_state(hub)
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(hub): State<SignalHub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, hub))
}

async fn index(State(hub): State<SignalHub>) -> String {
    format!(
        "TechMeet signaling relay: {} identities, {} links\n",
        hub.identity_count(),
        hub.link_count()
    )
}

async fn health_check() -> &'static str {
    "ok"
}

async fn handle_connection(socket: WebSocket, hub: SignalHub) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();
    let client_id = hub.attach(tx.clone());

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => match parse_frame(&text) {
                Ok(msg) => hub.handle(client_id, msg),
                Err(e) => {
                    tracing::warn!("Bad frame from {}: {}", client_id, e);
                    let _ = tx.send(SignalMessage::Error { message: e });
                }
            },
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", client_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    hub.detach(client_id);
    send_task.abort();
}

fn parse_frame(text: &str) -> Result<SignalMessage, String> {
    serde_json::from_str(text).map_err(|e| format!("invalid signal message: {e}"))
}
