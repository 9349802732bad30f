//! WebSocket transport: a listening server that serves exactly one viewer.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::{debug, error, info, warn};

use super::{LinkPhase, LinkState, PeerLink, ServiceThread, current_thread_runtime, pump};
use crate::envelope::{Envelope, Inbound};
use crate::error::{BridgeError, Result};
use crate::port::Endpoint;
use crate::queue::MessageQueue;

#[derive(Clone)]
struct SocketService {
    outbound: MessageQueue<Envelope>,
    inbound: MessageQueue<Inbound>,
    state: Arc<LinkState>,
    peer_taken: Arc<AtomicBool>,
}

pub struct SocketTransport {
    pub endpoint: Endpoint,
    pub state: Arc<LinkState>,
    thread: ServiceThread,
}

impl SocketTransport {
    /// Starts serving on an already-bound listener.
    pub fn spawn(
        listener: TcpListener,
        endpoint: Endpoint,
        outbound: MessageQueue<Envelope>,
        inbound: MessageQueue<Inbound>,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let runtime = current_thread_runtime()?;
        let state = LinkState::new(LinkPhase::Listening);
        let service = SocketService {
            outbound,
            inbound,
            state: state.clone(),
            peer_taken: Arc::new(AtomicBool::new(false)),
        };
        let addr = endpoint.to_string();
        let thread = ServiceThread::spawn("scenelink-socket", move || {
            runtime.block_on(serve(listener, service));
        })?;
        info!("viewer socket listening on {addr}");
        Ok(Self {
            endpoint,
            state,
            thread,
        })
    }

    pub fn phase(&self) -> LinkPhase {
        self.state.phase()
    }

    pub fn into_thread(self) -> ServiceThread {
        self.thread
    }
}

async fn serve(listener: TcpListener, service: SocketService) {
    let state = service.state.clone();
    let inbound = service.inbound.clone();
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!("viewer socket could not adopt listener: {err}");
            state.fail();
            inbound.close();
            return;
        }
    };
    let app = Router::new()
        .route("/", get(upgrade_viewer))
        .with_state(service);
    let shutdown_state = state.clone();
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_state.stopped().await })
        .await
    {
        error!("viewer socket exited unexpectedly: {err}");
        state.fail();
    }
    if state.phase() != LinkPhase::Failed {
        state.set_phase(LinkPhase::Closed);
    }
    inbound.close();
    debug!("viewer socket released");
}

async fn upgrade_viewer(ws: WebSocketUpgrade, State(service): State<SocketService>) -> Response {
    if service.peer_taken.swap(true, Ordering::AcqRel) {
        warn!("rejecting additional viewer connection; one viewer per session");
        return (StatusCode::CONFLICT, "a viewer is already connected").into_response();
    }
    ws.on_upgrade(move |socket| serve_viewer(socket, service))
}

async fn serve_viewer(socket: WebSocket, service: SocketService) {
    let peer_id = format!("viewer-{:08x}", rand::random::<u32>());
    info!("viewer connected: id={peer_id}");
    let phase = pump(
        WsLink { socket },
        service.outbound,
        service.inbound,
        service.state,
    )
    .await;
    info!("viewer session ended: id={peer_id}, phase={phase:?}");
}

struct WsLink {
    socket: WebSocket,
}

impl PeerLink for WsLink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| {
                debug!("websocket send failed: {err}");
                BridgeError::PeerDisconnected
            })
    }

    async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(String::from_utf8_lossy(&bytes).into_owned());
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!("websocket receive error: {err}");
                    return None;
                }
            }
        }
    }
}
