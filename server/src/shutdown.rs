use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// roughly 30 years, the same cap tokio applies to far future sleeps
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating to a far future instant instead of overflowing.
pub fn instant_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// A single point in time shared by every stop call of one shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: instant_after(timeout),
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Completes once the deadline has passed.
    pub async fn expired(&self) {
        time::sleep_until(self.at).await
    }
}

#[derive(Error, Debug)]
pub enum StopError {
    #[error("shutdown deadline exceeded")]
    DeadlineExceeded,

    #[error("stop task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
#[error("service {service} failed to stop: {source}")]
pub struct ServiceStopError {
    pub service: String,
    pub source: StopError,
}

#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("shutdown already started, reject registration of service {service}")]
    RegistrationClosed { service: String },

    #[error("shutdown already invoked")]
    AlreadyShutdown,

    #[error("fail install signal handler: {0}")]
    Signal(#[from] std::io::Error),

    #[error("{} service(s) failed to stop: {}", .0.len(), join_failures(.0))]
    Services(Vec<ServiceStopError>),
}

impl ShutdownError {
    /// Failures in registration order, empty for non aggregate errors.
    pub fn failures(&self) -> &[ServiceStopError] {
        match self {
            ShutdownError::Services(failures) => failures,
            _ => &[],
        }
    }
}

fn join_failures(failures: &[ServiceStopError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Anything the coordinator is able to stop.
///
/// Implementations must honor the deadline themselves: the coordinator only
/// bounds how long it waits, it never aborts a stop call.
#[async_trait]
pub trait Stoppable: Send + Sync {
    fn name(&self) -> &str;

    async fn stop(&self, deadline: Deadline) -> Result<(), StopError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Created,
    WaitingForSignal,
    ShuttingDown,
    Completed,
    CompletedWithErrors,
}

struct Registrations {
    state: ShutdownState,
    services: Vec<Arc<dyn Stoppable>>,
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_token: CancellationToken,
    timeout: Duration,
    listener: Arc<dyn Stoppable>,
    connection: Arc<dyn Stoppable>,
    registrations: Arc<Mutex<Registrations>>,
}

impl ShutdownCoordinator {
    pub fn new(
        timeout: Duration,
        listener: Arc<dyn Stoppable>,
        connection: Arc<dyn Stoppable>,
    ) -> Self {
        debug!(timeout = ?timeout, "create new shutdown coordinator");
        Self {
            shutdown_token: CancellationToken::new(),
            timeout,
            listener,
            connection,
            registrations: Arc::new(Mutex::new(Registrations {
                state: ShutdownState::Created,
                services: Vec::new(),
            })),
        }
    }

    /// Token cancelled as soon as shutdown begins, for background activities
    /// which should wind down before their stop is requested.
    pub fn subscribe(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    pub fn state(&self) -> ShutdownState {
        self.registrations.lock().expect("lock not poisoned").state
    }

    pub fn register(&self, service: Arc<dyn Stoppable>) -> Result<(), ShutdownError> {
        let mut registrations = self.registrations.lock().expect("lock not poisoned");
        match registrations.state {
            ShutdownState::Created | ShutdownState::WaitingForSignal => {
                debug!(service = service.name(), "register service for shutdown");
                registrations.services.push(service);
                Ok(())
            }
            _ => {
                warn!(
                    service = service.name(),
                    "reject service registration, shutdown already started"
                );
                Err(ShutdownError::RegistrationClosed {
                    service: service.name().to_string(),
                })
            }
        }
    }

    /// Block until the process receives SIGINT, SIGTERM or SIGQUIT, then shut
    /// everything down.
    pub async fn wait_for_shutdown(&self) -> Result<(), ShutdownError> {
        let signal = termination_signal()?;
        self.shutdown_on(signal).await
    }

    pub async fn shutdown_on<F>(&self, trigger: F) -> Result<(), ShutdownError>
    where
        F: Future<Output = ()>,
    {
        {
            let mut registrations = self.registrations.lock().expect("lock not poisoned");
            if registrations.state == ShutdownState::Created {
                registrations.state = ShutdownState::WaitingForSignal;
            }
        }
        debug!("wait for shutdown signal");
        trigger.await;
        info!("received shutdown signal");
        self.shutdown().await
    }

    /// Stop every registered service, the listener and the store connection
    /// concurrently under one deadline. Must only run once.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let mut services = {
            let mut registrations = self.registrations.lock().expect("lock not poisoned");
            match registrations.state {
                ShutdownState::Created | ShutdownState::WaitingForSignal => {
                    registrations.state = ShutdownState::ShuttingDown;
                }
                _ => return Err(ShutdownError::AlreadyShutdown),
            }
            registrations.services.clone()
        };
        services.push(self.listener.clone());
        services.push(self.connection.clone());

        self.shutdown_token.cancel();
        let deadline = Deadline::after(self.timeout);
        info!(
            services = services.len(),
            timeout = ?self.timeout,
            "start graceful shutdown"
        );

        // spawn every stop before awaiting any of them
        let handles: Vec<_> = services
            .into_iter()
            .map(|service| {
                let name = service.name().to_string();
                let handle = tokio::spawn(async move {
                    debug!(service = service.name(), "stop service");
                    service.stop(deadline).await
                });
                (name, handle)
            })
            .collect();

        let mut failures = Vec::new();
        for (service, handle) in handles {
            let result = match time::timeout_at(deadline.at(), handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(StopError::Panicked(e.to_string())),
                // left running in the background, it still owns the deadline
                Err(_) => Err(StopError::DeadlineExceeded),
            };
            match result {
                Ok(()) => debug!(service = %service, "service stopped"),
                Err(source) => {
                    warn!(service = %service, error = %source, "fail stop service");
                    failures.push(ServiceStopError { service, source });
                }
            }
        }

        let final_state = if failures.is_empty() {
            ShutdownState::Completed
        } else {
            ShutdownState::CompletedWithErrors
        };
        self.registrations.lock().expect("lock not poisoned").state = final_state;

        if failures.is_empty() {
            info!("graceful shutdown completed");
            Ok(())
        } else {
            warn!(failures = failures.len(), "graceful shutdown completed with errors");
            Err(ShutdownError::Services(failures))
        }
    }
}

#[cfg(unix)]
fn termination_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => debug!("received SIGINT signal"),
            _ = terminate.recv() => debug!("received SIGTERM signal"),
            _ = quit.recv() => debug!("received SIGQUIT signal"),
        }
    })
}

#[cfg(not(unix))]
fn termination_signal() -> std::io::Result<impl Future<Output = ()>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => debug!("received Ctrl+C signal"),
            Err(e) => warn!(error = ?e, "fail listen for Ctrl+C signal"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockService {
        name: String,
        delay: Duration,
        failure: Option<&'static str>,
        ignore_deadline: bool,
        calls: AtomicUsize,
    }

    impl MockService {
        fn new(name: &str, delay: Duration) -> Arc<Self> {
            Self::build(name, delay, None, false)
        }

        fn failing(name: &str, delay: Duration, failure: &'static str) -> Arc<Self> {
            Self::build(name, delay, Some(failure), false)
        }

        fn stubborn(name: &str, delay: Duration) -> Arc<Self> {
            Self::build(name, delay, None, true)
        }

        fn build(
            name: &str,
            delay: Duration,
            failure: Option<&'static str>,
            ignore_deadline: bool,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                delay,
                failure,
                ignore_deadline,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Stoppable for MockService {
        fn name(&self) -> &str {
            &self.name
        }

        async fn stop(&self, deadline: Deadline) -> Result<(), StopError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ignore_deadline {
                time::sleep(self.delay).await;
            } else {
                tokio::select! {
                    _ = time::sleep(self.delay) => {}
                    _ = deadline.expired() => return Err(StopError::DeadlineExceeded),
                }
            }
            match self.failure {
                Some(message) => Err(StopError::Other(anyhow!(message))),
                None => Ok(()),
            }
        }
    }

    struct PanickingService;

    #[async_trait]
    impl Stoppable for PanickingService {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn stop(&self, _deadline: Deadline) -> Result<(), StopError> {
            panic!("stop exploded");
        }
    }

    fn coordinator(timeout: Duration) -> (ShutdownCoordinator, Arc<MockService>, Arc<MockService>) {
        let listener = MockService::new("listener", Duration::ZERO);
        let connection = MockService::new("connection", Duration::ZERO);
        let coordinator = ShutdownCoordinator::new(timeout, listener.clone(), connection.clone());
        (coordinator, listener, connection)
    }

    fn failed_services(err: &ShutdownError) -> Vec<&str> {
        err.failures().iter().map(|f| f.service.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_called_exactly_once() {
        for count in [0, 1, 5] {
            let (coordinator, listener, connection) = coordinator(Duration::from_secs(5));
            let services: Vec<_> = (0..count)
                .map(|i| MockService::new(&format!("service-{i}"), Duration::from_millis(10)))
                .collect();
            for service in &services {
                coordinator.register(service.clone()).unwrap();
            }

            coordinator.shutdown().await.unwrap();

            for service in &services {
                assert_eq!(service.calls(), 1, "service {}", service.name);
            }
            assert_eq!(listener.calls(), 1);
            assert_eq!(connection.calls(), 1);
            assert_eq!(coordinator.state(), ShutdownState::Completed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_stops_twice() {
        let (coordinator, _, _) = coordinator(Duration::from_secs(5));
        let service = MockService::new("dup", Duration::ZERO);
        coordinator.register(service.clone()).unwrap();
        coordinator.register(service.clone()).unwrap();

        coordinator.shutdown().await.unwrap();
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_run_concurrently() {
        let (coordinator, _, _) = coordinator(Duration::from_secs(30));
        for secs in 1..=5 {
            coordinator
                .register(MockService::new(
                    &format!("service-{secs}"),
                    Duration::from_secs(secs),
                ))
                .unwrap();
        }

        let start = Instant::now();
        coordinator.shutdown().await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_shutdown() {
        let (coordinator, _, _) = coordinator(Duration::from_secs(1));
        coordinator
            .register(MockService::new("fast", Duration::from_millis(100)))
            .unwrap();
        coordinator
            .register(MockService::stubborn("stubborn", Duration::from_secs(10)))
            .unwrap();
        coordinator
            .register(MockService::new("slow", Duration::from_secs(5)))
            .unwrap();

        let start = Instant::now();
        let err = coordinator.shutdown().await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_millis(1100), "took {elapsed:?}");
        assert_eq!(failed_services(&err), vec!["stubborn", "slow"]);
        for failure in err.failures() {
            assert!(matches!(failure.source, StopError::DeadlineExceeded));
        }
        assert!(err.to_string().contains("stubborn"));
        assert_eq!(coordinator.state(), ShutdownState::CompletedWithErrors);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_follow_registration_order() {
        let (coordinator, _, _) = coordinator(Duration::from_secs(30));
        coordinator
            .register(MockService::new("a", Duration::from_millis(500)))
            .unwrap();
        coordinator
            .register(MockService::failing("b", Duration::from_secs(2), "b broke"))
            .unwrap();
        coordinator
            .register(MockService::failing("c", Duration::ZERO, "c broke"))
            .unwrap();

        let err = coordinator.shutdown().await.unwrap_err();

        assert_eq!(failed_services(&err), vec!["b", "c"]);
        let message = err.to_string();
        assert!(message.find("b broke").unwrap() < message.find("c broke").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_and_connection_reported_last() {
        let listener = MockService::failing("listener", Duration::ZERO, "listener broke");
        let connection = MockService::failing("connection", Duration::ZERO, "connection broke");
        let coordinator =
            ShutdownCoordinator::new(Duration::from_secs(5), listener, connection.clone());
        coordinator
            .register(MockService::failing("task", Duration::from_secs(1), "task broke"))
            .unwrap();

        let err = coordinator.shutdown().await.unwrap_err();
        assert_eq!(
            failed_services(&err),
            vec!["task", "listener", "connection"]
        );
        assert_eq!(connection.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_stop_is_reported() {
        let (coordinator, listener, _) = coordinator(Duration::from_secs(5));
        coordinator.register(Arc::new(PanickingService)).unwrap();

        let err = coordinator.shutdown().await.unwrap_err();

        assert_eq!(failed_services(&err), vec!["panicking"]);
        assert!(matches!(err.failures()[0].source, StopError::Panicked(_)));
        assert_eq!(listener.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_runs_once() {
        let (coordinator, listener, _) = coordinator(Duration::from_secs(5));
        coordinator.shutdown().await.unwrap();

        let err = coordinator.shutdown().await.unwrap_err();
        assert!(matches!(err, ShutdownError::AlreadyShutdown));
        assert_eq!(listener.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_after_shutdown_rejected() {
        let (coordinator, _, _) = coordinator(Duration::from_secs(5));
        coordinator.shutdown().await.unwrap();

        let late = MockService::new("late", Duration::ZERO);
        let err = coordinator.register(late.clone()).unwrap_err();

        assert!(matches!(err, ShutdownError::RegistrationClosed { ref service } if service == "late"));
        assert_eq!(late.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_on_trigger() {
        let (coordinator, listener, _) = coordinator(Duration::from_secs(5));
        let token = coordinator.subscribe();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .shutdown_on(async {
                        let _ = rx.await;
                    })
                    .await
            })
        };

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.state(), ShutdownState::WaitingForSignal);
        assert!(!token.is_cancelled());
        assert_eq!(listener.calls(), 0);

        tx.send(()).unwrap();
        waiter.await.unwrap().unwrap();

        assert!(token.is_cancelled());
        assert_eq!(listener.calls(), 1);
        assert_eq!(coordinator.state(), ShutdownState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_shutdown() {
        let (coordinator, listener, connection) = coordinator(Duration::from_secs(30));
        let services = vec![
            MockService::new("one-second", Duration::from_secs(1)),
            MockService::new("two-seconds", Duration::from_secs(2)),
            MockService::failing("disk", Duration::ZERO, "disk full"),
        ];
        for service in &services {
            coordinator.register(service.clone()).unwrap();
        }

        let start = Instant::now();
        let err = coordinator.shutdown().await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2500), "took {elapsed:?}");
        assert!(err.to_string().contains("disk full"));
        assert_eq!(failed_services(&err), vec!["disk"]);
        for service in &services {
            assert_eq!(service.calls(), 1);
        }
        assert_eq!(listener.calls(), 1);
        assert_eq!(connection.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_saturates() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() >= FAR_FUTURE - Duration::from_secs(1));

        let (coordinator, listener, connection) = coordinator(Duration::from_secs(u64::MAX));
        coordinator.shutdown().await.unwrap();
        assert_eq!(listener.calls(), 1);
        assert_eq!(connection.calls(), 1);
        assert_eq!(coordinator.state(), ShutdownState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_remaining() {
        let deadline = Deadline::after(Duration::from_secs(2));
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::from_secs(2));

        deadline.expired().await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
