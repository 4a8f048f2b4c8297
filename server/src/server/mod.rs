use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{FromRef, Request},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    Json, Router,
};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server,
};
use serde_json::json;
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, task::JoinHandle, time};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower::{Service, ServiceExt};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::{
    auth::{AuthError, TokenManager},
    db::UserStoreError,
    error::AppError,
    metrics as counter,
    shutdown::{Deadline, StopError, Stoppable},
    users::UserService,
};

pub mod metrics;
pub mod status;
pub mod users;

#[derive(Debug, Clone)]
pub struct Dependencies {
    metrics: counter::Metrics,
    users: UserService,
    tokens: TokenManager,
}

impl Dependencies {
    pub fn new(metrics: counter::Metrics, users: UserService, tokens: TokenManager) -> Self {
        Self {
            metrics,
            users,
            tokens,
        }
    }
}

impl FromRef<Dependencies> for TokenManager {
    fn from_ref(deps: &Dependencies) -> Self {
        deps.tokens.clone()
    }
}

#[derive(Debug, Clone)]
pub struct Server {
    request_timeout: Duration,
    deps: Dependencies,
}

impl Server {
    pub fn new(
        request_timeout: Duration,
        metrics: counter::Metrics,
        users: UserService,
        tokens: TokenManager,
    ) -> Self {
        debug!(request_timeout = ?request_timeout, "create new server");
        Self {
            request_timeout,
            deps: Dependencies::new(metrics, users, tokens),
        }
    }

    pub fn router(&self) -> Router {
        status::create_router(self.deps.clone())
            .merge(metrics::create_router(self.deps.clone()))
            .merge(users::create_router(self.deps.clone()))
            .layer(middleware::from_fn_with_state(
                self.deps.clone(),
                metrics::track_requests,
            ))
            .layer(TimeoutLayer::new(self.request_timeout))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on `listener` in the background. The returned handle stops the
    /// accept loop and drains open connections.
    pub fn start(&self, listener: TcpListener) -> Result<ServerHandle> {
        serve(listener, self.router())
    }
}

fn serve(listener: TcpListener, router: Router) -> Result<ServerHandle> {
    let addr = listener.local_addr()?;
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    info!(address = %addr, "serving on address");

    let accept = tokio::spawn(accept_loop(
        listener,
        router,
        token.clone(),
        tracker.clone(),
    ));

    Ok(ServerHandle {
        addr,
        token,
        tracker,
        accept: Arc::new(Mutex::new(Some(accept))),
    })
}

async fn accept_loop(
    listener: TcpListener,
    router: Router,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let mut make_service = router.into_make_service_with_connect_info::<SocketAddr>();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("shutdown signal received, stopping server");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, remote_addr)) => {
                        let tower_service = unwrap_infallible(make_service.call(remote_addr).await);
                        let token = token.clone();
                        tracker.spawn(async move {
                            let socket = TokioIo::new(socket);
                            let hyper_service =
                                hyper::service::service_fn(move |request: Request<Incoming>| {
                                    tower_service.clone().oneshot(request)
                                });
                            let builder = server::conn::auto::Builder::new(TokioExecutor::new());
                            let conn = builder.serve_connection(socket, hyper_service);
                            tokio::pin!(conn);

                            tokio::select! {
                                result = conn.as_mut() => {
                                    if let Err(err) = result {
                                        warn!(err = ?err, "fail serve connection");
                                    }
                                }
                                _ = token.cancelled() => {
                                    // finish in flight requests, refuse new ones on this connection
                                    conn.as_mut().graceful_shutdown();
                                    if let Err(err) = conn.await {
                                        warn!(err = ?err, "fail drain connection");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = ?e, "fail accept connection");
                    }
                }
            }
        }
    }
    debug!("server stopped accepting connections");
}

fn unwrap_infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => match err {},
    }
}

/// Running server registered with the shutdown coordinator as the listener.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    addr: SocketAddr,
    token: CancellationToken,
    tracker: TaskTracker,
    accept: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Stoppable for ServerHandle {
    fn name(&self) -> &str {
        "http-server"
    }

    async fn stop(&self, deadline: Deadline) -> Result<(), StopError> {
        info!(address = %self.addr, "shutdown http server");
        self.token.cancel();

        let accept = self.accept.lock().expect("lock not poisoned").take();
        if let Some(accept) = accept {
            match time::timeout_at(deadline.at(), accept).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "accept loop ended abnormally");
                    return Err(StopError::Panicked(e.to_string()));
                }
                Err(_) => return Err(StopError::DeadlineExceeded),
            }
        }

        self.tracker.close();
        debug!(connections = self.tracker.len(), "wait for open connections");
        tokio::select! {
            _ = self.tracker.wait() => {}
            _ = deadline.expired() => {
                warn!(
                    connections = self.tracker.len(),
                    "connections still open at deadline"
                );
                return Err(StopError::DeadlineExceeded);
            }
        }

        debug!("http server shutdown completed");
        Ok(())
    }
}

fn error_parts(err: &AppError) -> (StatusCode, &'static str) {
    match err {
        AppError::UserStore(UserStoreError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        }
        AppError::UserStore(
            UserStoreError::InvalidId { .. }
            | UserStoreError::EmailExists { .. }
            | UserStoreError::NoFieldsToUpdate,
        )
        | AppError::Validation(_) => (StatusCode::BAD_REQUEST, "REQUEST_VALIDATION_EXCEPTION"),
        AppError::UserStore(UserStoreError::Closed) => {
            (StatusCode::SERVICE_UNAVAILABLE, "DOWNSTREAM_EXCEPTION")
        }
        AppError::Auth(AuthError::MissingToken) => {
            (StatusCode::UNAUTHORIZED, "MISSING_CREDENTIALS")
        }
        AppError::Auth(AuthError::InvalidToken) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        AppError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "UNHANDLED_EXCEPTION"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = error_parts(&self);
        let error_message = match &self {
            AppError::UserStore(e) if status != StatusCode::INTERNAL_SERVER_ERROR => e.to_string(),
            AppError::Auth(e) if status != StatusCode::INTERNAL_SERVER_ERROR => e.to_string(),
            AppError::Validation(e) => e.to_string(),
            AppError::InvalidCredentials => self.to_string(),
            _ => {
                error!(error = %self, "unhandled request error");
                "internal server error".to_string()
            }
        };
        let body = Json(json!({
            "code": code,
            "error": error_message,
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemory;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::Notify;

    fn test_server() -> Server {
        let tokens = TokenManager::new("test-secret", Duration::from_secs(3600));
        let users = UserService::new(Arc::new(InMemory::new()), tokens.clone());
        Server::new(
            Duration::from_secs(5),
            counter::Metrics::new(),
            users,
            tokens,
        )
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                AppError::UserStore(UserStoreError::NotFound { id: "x".into() }),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::UserStore(UserStoreError::InvalidId { id: "x".into() }),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::UserStore(UserStoreError::EmailExists { email: "x".into() }),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::UserStore(UserStoreError::Closed),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::UserStore(UserStoreError::DeadlineExceeded),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AppError::Auth(AuthError::MissingToken),
                StatusCode::UNAUTHORIZED,
            ),
            (
                AppError::Auth(AuthError::PasswordHash("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::InvalidCredentials, StatusCode::UNAUTHORIZED),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_server_stop_closes_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = test_server().start(listener).unwrap();
        let addr = handle.local_addr();

        tokio::net::TcpStream::connect(addr).await.unwrap();

        handle
            .stop(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        // second stop finds nothing left to drain
        handle
            .stop(Deadline::after(Duration::from_secs(1)))
            .await
            .unwrap();
    }

    // serves GET /slow, which blocks until `release` is notified
    async fn start_slow_server(
        entered: Arc<Notify>,
        release: Arc<Notify>,
    ) -> (ServerHandle, TcpStream) {
        let router = Router::new().route(
            "/slow",
            get(move || {
                let entered = entered.clone();
                let release = release.clone();
                async move {
                    entered.notify_one();
                    release.notified().await;
                    "done"
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = serve(listener, router).unwrap();

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        stream
            .write_all(b"GET /slow HTTP/1.1\r\nhost: localhost\r\n\r\n")
            .await
            .unwrap();
        (handle, stream)
    }

    #[tokio::test]
    async fn test_server_stop_deadline_with_request_in_flight() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (handle, _stream) = start_slow_server(entered.clone(), release.clone()).await;
        entered.notified().await;

        let start = time::Instant::now();
        let err = handle
            .stop(Deadline::after(Duration::from_millis(200)))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, StopError::DeadlineExceeded));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
        release.notify_one();
    }

    #[tokio::test]
    async fn test_server_stop_drains_request_in_flight() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (handle, mut stream) = start_slow_server(entered.clone(), release.clone()).await;
        entered.notified().await;

        let releaser = tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            release.notify_one();
        });
        handle
            .stop(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        releaser.await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "got {response:?}");
        assert!(response.ends_with("done"));
    }
}
