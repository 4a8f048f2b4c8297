use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub route: String,
    pub status: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabel {
    pub task: String,
}

#[derive(Default, Debug, Clone)]
pub struct UserMetrics {
    pub users_current: Gauge,
}

#[derive(Default, Debug, Clone)]
pub struct HttpMetrics {
    pub requests_total: Family<RequestLabels, Counter>,
}

#[derive(Default, Debug, Clone)]
pub struct TaskMetrics {
    pub periodic_runs_total: Family<TaskLabel, Counter>,
}

#[derive(Default, Debug, Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub users: UserMetrics,
    pub http: HttpMetrics,
    pub tasks: TaskMetrics,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let users = UserMetrics::default();
        let http = HttpMetrics::default();
        let tasks = TaskMetrics::default();

        registry.register(
            "accounts_users_current",
            "Number of registered users",
            users.users_current.clone(),
        );
        registry.register(
            "accounts_requests",
            "Total HTTP requests handled",
            http.requests_total.clone(),
        );
        registry.register(
            "accounts_periodic_runs",
            "Total periodic task runs",
            tasks.periodic_runs_total.clone(),
        );

        Metrics {
            registry: Arc::new(registry),
            users,
            http,
            tasks,
        }
    }
}
