//! HTTP content server.

use axum::body::Body;
use axum::extract::{ConnectInfo, Path as UrlPath, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::index::ManifestStore;
use crate::security::{ConnectionSecurity, RequestPhase};
use crate::watch::ManifestWatcher;

/// Failure replies. Bodies never carry the reason.
#[derive(Debug)]
pub enum ServeError {
    Unauthorized,
    NotFound,
    MethodNotAllowed,
    Internal(String),
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            Self::NotFound => (StatusCode::NOT_FOUND, "Not Found"),
            Self::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
            Self::Internal(e) => {
                tracing::error!("internal error while serving: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };
        (status, message).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    store: Arc<ManifestStore>,
    security: Arc<dyn ConnectionSecurity>,
    log_client_ips: bool,
}

/// Routes, challenge decoration and request tracing around one store and one provider.
pub fn router(
    store: Arc<ManifestStore>,
    security: Arc<dyn ConnectionSecurity>,
    log_client_ips: bool,
) -> Router {
    let state = AppState { store, security, log_client_ips };
    Router::new()
        // GET only; `get()` would also answer HEAD.
        .route("/authenticate", on(MethodFilter::GET, authenticate))
        .route("/servermanifest.json", on(MethodFilter::GET, manifest))
        .route("/files/*path", on(MethodFilter::GET, file))
        .fallback(fallback)
        .layer(middleware::from_fn_with_state(state.clone(), attach_challenge))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs after the handler, so validation always sees the challenge issued before this request.
async fn attach_challenge(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let request_headers = request.headers().clone();
    let mut response = next.run(request).await;
    state.security.issue_challenge(&request_headers, response.headers_mut());
    response
}

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    phase: RequestPhase,
) -> std::result::Result<(), ServeError> {
    let security = Arc::clone(&state.security);
    let headers = headers.clone();
    let allowed = tokio::task::spawn_blocking(move || security.validate_request(&headers, phase))
        .await
        .map_err(|e| ServeError::Internal(format!("validation task failed: {e}")))?;
    if allowed {
        Ok(())
    } else {
        Err(ServeError::Unauthorized)
    }
}

fn client_label(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    if !state.log_client_ips {
        return "[IP hidden]".to_string();
    }
    let forwarded: Vec<&str> =
        headers.get_all("x-forwarded-for").iter().filter_map(|v| v.to_str().ok()).collect();
    if forwarded.is_empty() {
        addr.to_string()
    } else {
        format!("{} (using remote address {})", forwarded.join(" via "), addr)
    }
}

async fn authenticate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> std::result::Result<&'static str, ServeError> {
    if !state.security.needs_handshake() {
        return Err(ServeError::NotFound);
    }
    let who = client_label(&state, &headers, addr);
    if let Err(e) = authorize(&state, &headers, RequestPhase::Handshake).await {
        tracing::warn!("authentication of {} rejected", who);
        return Err(e);
    }
    tracing::info!("authenticated {}", who);
    Ok("Authenticated")
}

async fn manifest(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> std::result::Result<Response, ServeError> {
    let who = client_label(&state, &headers, addr);
    if let Err(e) = authorize(&state, &headers, RequestPhase::Authenticated).await {
        tracing::warn!("manifest request from {} rejected", who);
        return Err(e);
    }
    tracing::info!("sending manifest to {}", who);
    let published = state.store.current();
    Ok(([(header::CONTENT_TYPE, "application/json")], published.json.clone()).into_response())
}

async fn file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, ServeError> {
    let who = client_label(&state, &headers, addr);
    if let Err(e) = authorize(&state, &headers, RequestPhase::Authenticated).await {
        tracing::warn!("file request for {} from {} rejected", name, who);
        return Err(e);
    }
    let published = state.store.current();
    let Some(exposed) = published.index.get(&name) else {
        tracing::debug!("{} requested unknown file {}", who, name);
        return Err(ServeError::NotFound);
    };

    let f = match tokio::fs::File::open(&exposed.path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("exposed file {} vanished before it could be served", exposed.name);
            return Err(ServeError::NotFound);
        }
        Err(e) => return Err(ServeError::Internal(format!("{}: {e}", exposed.path.display()))),
    };
    let len = f
        .metadata()
        .await
        .map_err(|e| ServeError::Internal(format!("{}: {e}", exposed.path.display())))?
        .len();
    tracing::info!("sending {} ({} bytes) to {}", exposed.name, len, who);

    let body = Body::from_stream(ReaderStream::new(f.take(len)));
    let filename = HeaderValue::from_str(&exposed.name)
        .map_err(|e| ServeError::Internal(format!("file name header: {e}")))?;
    let mut response = Response::new(body);
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    h.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    h.insert("filename", filename);
    Ok(response)
}

async fn fallback(method: Method) -> ServeError {
    if method == Method::GET {
        ServeError::NotFound
    } else {
        ServeError::MethodNotAllowed
    }
}

/// Build the server state: first manifest, then the watcher that keeps it current.
fn prepare(config: ServerConfig) -> Result<(Arc<ManifestStore>, ManifestWatcher)> {
    let store = Arc::new(ManifestStore::open(config)?);
    let watcher = ManifestWatcher::start(Arc::clone(&store))?;
    for root in store.server_content_roots() {
        tracing::info!("server content root {}", root.display());
    }
    Ok((store, watcher))
}

fn runtime(io_threads: usize) -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(io_threads.max(1))
        .thread_name("packsync-io")
        .enable_all()
        .build()
        .map_err(|e| SyncError::Configuration(format!("cannot start runtime: {e}")))
}

fn bind(addr: &str) -> Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|e| SyncError::Configuration(format!("cannot listen on {addr}: {e}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| SyncError::Configuration(format!("cannot configure {addr}: {e}")))?;
    Ok(listener)
}

/// Serve until interrupted. Blocks the calling thread.
pub fn serve(config: ServerConfig, security: Arc<dyn ConnectionSecurity>) -> Result<()> {
    let rt = runtime(config.io_threads)?;
    let listener = bind(&config.listen_addr)?;
    let log_ips = config.log_client_ips;
    let (store, _watcher) = prepare(config)?;
    let app = router(store, security, log_ips);

    rt.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("serving on {}", addr);
        }
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|e| SyncError::Transport(format!("server failed: {e}")))
    })
}

/// A server running on a background thread.
pub struct ServerHandle {
    addr: SocketAddr,
    store: Arc<ManifestStore>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    _watcher: ManifestWatcher,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://<addr>/`, ready for a client's `remote_server`.
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn store(&self) -> &Arc<ManifestStore> {
        &self.store
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start serving on a background thread and return once the socket is bound.
pub fn spawn(config: ServerConfig, security: Arc<dyn ConnectionSecurity>) -> Result<ServerHandle> {
    let rt = runtime(config.io_threads)?;
    let listener = bind(&config.listen_addr)?;
    let addr = listener
        .local_addr()
        .map_err(|e| SyncError::Configuration(format!("{}: {e}", config.listen_addr)))?;
    let log_ips = config.log_client_ips;
    let (store, watcher) = prepare(config)?;
    let app = router(Arc::clone(&store), security, log_ips);
    let (tx, rx) = oneshot::channel::<()>();

    let thread = thread::Builder::new()
        .name("packsync-server".into())
        .spawn(move || {
            rt.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::error!("cannot adopt listener: {}", e);
                        return;
                    }
                };
                let served = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await;
                if let Err(e) = served {
                    tracing::error!("server failed: {}", e);
                }
            });
        })
        .map_err(|e| SyncError::Configuration(format!("cannot start server thread: {e}")))?;

    tracing::info!("serving on {}", addr);
    Ok(ServerHandle { addr, store, shutdown: Some(tx), thread: Some(thread), _watcher: watcher })
}
