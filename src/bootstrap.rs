//! HTTP server that hands the browser its connection target.
//!
//! `/` redirects to `/?<token>`, and `/?<token>` serves the embedded viewer
//! page. With the data channel transport active, `POST /offer` carries the
//! SDP exchange through the session's queues.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use include_dir::{Dir, include_dir};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::envelope::{Inbound, SessionDescription};
use crate::error::{BridgeError, Result};
use crate::port::{Endpoint, ProtocolKind};
use crate::queue::{MessageQueue, QueueError};
use crate::transport::{LinkPhase, LinkState, ServiceThread, current_thread_runtime};

static FRONTEND_ASSETS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/ui");

/// The SDP exchange between the `/offer` route and the control thread.
///
/// Offers go onto the session's inbound queue; the answer comes back on a
/// queue of its own. One offer is accepted per session.
#[derive(Clone)]
pub struct Signaling {
    inbound: MessageQueue<Inbound>,
    answers: MessageQueue<SessionDescription>,
    timeout: Duration,
    offer_taken: Arc<AtomicBool>,
}

impl Signaling {
    pub fn new(inbound: MessageQueue<Inbound>, timeout: Duration) -> Self {
        Self {
            inbound,
            answers: MessageQueue::new(),
            timeout,
            offer_taken: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hands the answer to the waiting `/offer` request.
    pub fn answer(&self, answer: SessionDescription) -> Result<()> {
        if self.answers.push(answer) {
            Ok(())
        } else {
            Err(BridgeError::Signaling(
                "signaling closed before the answer was delivered".into(),
            ))
        }
    }

    /// Releases any request still waiting for an answer.
    pub fn close(&self) {
        self.answers.close();
    }
}

#[derive(Clone)]
struct BootstrapState {
    token: String,
    location: String,
    signaling: Option<Signaling>,
}

pub struct BootstrapServer {
    pub endpoint: Endpoint,
    pub state: Arc<LinkState>,
    url: String,
    thread: ServiceThread,
}

impl BootstrapServer {
    /// Serves on `listener`, redirecting the bare root to `/?{token}`.
    /// Without a token the page is pointed back at this server's own
    /// signaling route (`rtc<port>`).
    pub fn spawn(
        listener: TcpListener,
        endpoint: Endpoint,
        token: Option<String>,
        signaling: Option<Signaling>,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let token = token.unwrap_or_else(|| {
            Endpoint::new(endpoint.host.clone(), endpoint.port, ProtocolKind::DataChannel).token()
        });
        let runtime = current_thread_runtime()?;
        let state = LinkState::new(LinkPhase::Listening);
        let url = format!("http://{}:{}/?{token}", endpoint.host, endpoint.port);
        let app = router(BootstrapState {
            token,
            location: url.clone(),
            signaling,
        });
        let task_state = state.clone();
        let thread = ServiceThread::spawn("scenelink-http", move || {
            runtime.block_on(serve(listener, app, task_state));
        })?;
        info!("viewer page available at {url}");
        Ok(Self {
            endpoint,
            state,
            url,
            thread,
        })
    }

    /// Full URL of the viewer page, token included.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn into_thread(self) -> ServiceThread {
        self.thread
    }
}

fn router(state: BootstrapState) -> Router {
    let with_signaling = state.signaling.is_some();
    let mut app = Router::new()
        .route("/", get(viewer_root))
        .route("/favicon.ico", get(favicon))
        .route("/retrieve/{*path}", get(retrieve_file))
        .route("/{*path}", get(frontend_path));
    if with_signaling {
        app = app.route("/offer", post(offer_handler));
    }
    app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .with_state(state)
}

async fn serve(listener: TcpListener, app: Router, state: Arc<LinkState>) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!("bootstrap server could not adopt listener: {err}");
            state.fail();
            return;
        }
    };
    let shutdown_state = state.clone();
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_state.stopped().await })
        .await
    {
        error!("bootstrap server exited unexpectedly: {err}");
        state.fail();
        return;
    }
    state.set_phase(LinkPhase::Closed);
    debug!("bootstrap server released");
}

async fn viewer_root(State(state): State<BootstrapState>, RawQuery(query): RawQuery) -> Response {
    if query.as_deref() == Some(state.token.as_str()) {
        return serve_frontend_asset("");
    }
    let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
    match HeaderValue::from_str(&state.location) {
        Ok(location) => {
            response.headers_mut().insert(header::LOCATION, location);
            response
        }
        Err(err) => {
            error!("redirect target is not a valid header: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn frontend_path(Path(path): Path<String>) -> Response {
    serve_frontend_asset(&path)
}

/// Serves a file from the local filesystem by its real path, e.g. meshes
/// referenced by the scene.
async fn retrieve_file(Path(path): Path<String>) -> Response {
    let file_path = local_path(&path);
    match tokio::fs::read(&file_path).await {
        Ok(contents) => {
            let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
            let mut response = Response::new(Body::from(contents));
            if let Ok(content_type) = HeaderValue::from_str(mime.as_ref()) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, content_type);
            }
            response
        }
        Err(err) => {
            debug!("retrieve {} failed: {err}", file_path.display());
            (StatusCode::NOT_FOUND, format!("no such file: {path}")).into_response()
        }
    }
}

fn local_path(path: &str) -> PathBuf {
    let bytes = path.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if has_drive || path.starts_with('/') {
        PathBuf::from(path)
    } else {
        PathBuf::from(format!("/{path}"))
    }
}

async fn offer_handler(
    State(state): State<BootstrapState>,
    Json(offer): Json<SessionDescription>,
) -> std::result::Result<Json<SessionDescription>, (StatusCode, String)> {
    let Some(signaling) = state.signaling else {
        return Err((StatusCode::NOT_FOUND, "signaling is not enabled".to_string()));
    };
    if signaling.offer_taken.swap(true, Ordering::AcqRel) {
        warn!("rejecting sdp offer: a viewer already negotiated this session");
        return Err((
            StatusCode::CONFLICT,
            "a viewer is already attached to this session".to_string(),
        ));
    }
    info!("received sdp offer from viewer");
    if !signaling.inbound.push(Inbound::Offer(offer)) {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "session is shutting down".to_string(),
        ));
    }
    let answers = signaling.answers.clone();
    let timeout = signaling.timeout;
    let popped = tokio::task::spawn_blocking(move || answers.pop(Some(timeout)))
        .await
        .map_err(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("signaling task failed: {err}"),
            )
        })?;
    match popped {
        Ok(answer) => Ok(Json(answer)),
        Err(QueueError::Timeout) => Err((
            StatusCode::GATEWAY_TIMEOUT,
            format!("no answer within {timeout:?}"),
        )),
        Err(QueueError::Closed) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "session closed before answering".to_string(),
        )),
    }
}

fn serve_frontend_asset(path: &str) -> Response {
    let normalized = path.trim_start_matches('/');
    let candidate = if normalized.is_empty() {
        "index.html"
    } else {
        normalized
    };
    frontend_asset_response(candidate).unwrap_or_else(|| StatusCode::NOT_FOUND.into_response())
}

fn frontend_asset_response(path: &str) -> Option<Response> {
    let file = FRONTEND_ASSETS.get_file(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let content_type = HeaderValue::from_str(mime.as_ref()).ok()?;
    let mut response = Response::new(Body::from(file.contents().to_vec()));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    if path == "index.html" {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::envelope::Envelope;
    use crate::port::PortBinder;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn start(signaling: Option<Signaling>) -> BootstrapServer {
        let binder = PortBinder::new(
            "127.0.0.1",
            PortRange::new(52300, 52399),
            Duration::from_secs(1),
        );
        let (_, server) = binder
            .bind_with(ProtocolKind::Http, |listener, endpoint| {
                BootstrapServer::spawn(listener, endpoint, Some("53000".into()), signaling)
            })
            .unwrap();
        server
    }

    fn request(server: &BootstrapServer, raw: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", server.endpoint.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(raw.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    fn get(server: &BootstrapServer, path: &str) -> String {
        request(
            server,
            &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"),
        )
    }

    fn shut_down(server: BootstrapServer) {
        server.state.stop();
        assert!(server.into_thread().join(Duration::from_secs(2)));
    }

    #[test]
    fn bare_root_redirects_to_token() {
        let server = start(None);
        let response = get(&server, "/");
        assert!(response.starts_with("HTTP/1.1 301"), "{response}");
        let location = format!("location: http://127.0.0.1:{}/?53000", server.endpoint.port);
        assert!(response.to_ascii_lowercase().contains(&location), "{response}");
        shut_down(server);
    }

    #[test]
    fn token_query_serves_viewer_page() {
        let server = start(None);
        let response = get(&server, "/?53000");
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.to_ascii_lowercase().contains("cache-control: no-cache"));
        assert!(response.contains("<html"));
        let stale = get(&server, "/?53001");
        assert!(stale.starts_with("HTTP/1.1 301"));
        shut_down(server);
    }

    #[test]
    fn retrieve_reads_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = dir.path().join("part.obj");
        std::fs::write(&mesh, "v 0 0 0\n").unwrap();
        let server = start(None);

        let response = get(&server, &format!("/retrieve{}", mesh.display()));
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("v 0 0 0\n"));

        let missing = get(&server, "/retrieve/definitely/not/here.stl");
        assert!(missing.starts_with("HTTP/1.1 404"));
        shut_down(server);
    }

    #[test]
    fn offer_route_absent_without_signaling() {
        let server = start(None);
        let response = request(
            &server,
            "POST /offer HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
        );
        assert!(!response.starts_with("HTTP/1.1 200"), "{response}");
        shut_down(server);
    }

    fn post_offer(server: &BootstrapServer) -> String {
        let body = r#"{"sdp":"v=0 offer","type":"offer"}"#;
        request(
            server,
            &format!(
                "POST /offer HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ),
        )
    }

    #[test]
    fn offer_is_answered_through_the_queues() {
        let inbound = MessageQueue::new();
        let signaling = Signaling::new(inbound.clone(), Duration::from_secs(5));
        let server = start(Some(signaling.clone()));

        let control = std::thread::spawn(move || {
            let Ok(Inbound::Offer(offer)) = inbound.pop(Some(Duration::from_secs(5))) else {
                panic!("expected an offer on the inbound queue");
            };
            assert_eq!(offer.kind, "offer");
            signaling
                .answer(SessionDescription {
                    sdp: "v=0 answer".into(),
                    kind: "answer".into(),
                })
                .unwrap();
            inbound
        });

        let response = post_offer(&server);
        let inbound = control.join().unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains(r#""type":"answer""#));

        // A reloaded page offers again; the session keeps its first viewer.
        let reload = post_offer(&server);
        assert!(reload.starts_with("HTTP/1.1 409"), "{reload}");
        assert!(inbound.is_empty());
        shut_down(server);
    }

    #[test]
    fn pending_offer_leaves_session_traffic_alone() {
        let inbound = MessageQueue::new();
        let outbound = MessageQueue::new();
        let signaling = Signaling::new(inbound.clone(), Duration::from_millis(300));
        let server = start(Some(signaling));

        let pusher = {
            let outbound = outbound.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                outbound.push(Envelope::new("shape_poses", serde_json::json!({}), true));
                outbound.push(Envelope::new("sim_time", serde_json::json!(0.1), false));
            })
        };
        let response = post_offer(&server);
        pusher.join().unwrap();
        assert!(response.starts_with("HTTP/1.1 504"), "{response}");
        assert!(matches!(inbound.try_pop(), Some(Inbound::Offer(_))));

        let commands: Vec<String> = std::iter::from_fn(|| outbound.try_pop())
            .map(|envelope: Envelope| envelope.command)
            .collect();
        assert_eq!(commands, ["shape_poses", "sim_time"]);
        shut_down(server);
    }

    #[test]
    fn closing_signaling_releases_a_waiting_offer() {
        let inbound = MessageQueue::new();
        let signaling = Signaling::new(inbound.clone(), Duration::from_secs(10));
        let server = start(Some(signaling.clone()));

        let closer = std::thread::spawn(move || {
            assert!(matches!(
                inbound.pop(Some(Duration::from_secs(5))),
                Ok(Inbound::Offer(_))
            ));
            signaling.close();
        });
        let started = std::time::Instant::now();
        let response = post_offer(&server);
        closer.join().unwrap();
        assert!(response.starts_with("HTTP/1.1 503"), "{response}");
        assert!(started.elapsed() < Duration::from_secs(5));
        shut_down(server);
    }

    #[test]
    fn signaling_server_points_page_at_itself() {
        let binder = PortBinder::new(
            "127.0.0.1",
            PortRange::new(52400, 52499),
            Duration::from_secs(1),
        );
        let (endpoint, server) = binder
            .bind_with(ProtocolKind::Http, |listener, endpoint| {
                BootstrapServer::spawn(listener, endpoint, None, None)
            })
            .unwrap();
        assert_eq!(
            server.url(),
            format!("http://127.0.0.1:{}/?rtc{}", endpoint.port, endpoint.port)
        );
        shut_down(server);
    }

    #[test]
    fn local_paths_keep_their_root() {
        assert_eq!(local_path("tmp/a.stl"), PathBuf::from("/tmp/a.stl"));
        assert_eq!(local_path("C:/meshes/a.stl"), PathBuf::from("C:/meshes/a.stl"));
    }
}
