use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

pub fn init_tracing() {
    let filter = EnvFilter::from_default_env()
        .add_directive("collector_service=info".parse().unwrap_or_else(|_| "info".parse().unwrap()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Install the Prometheus recorder and return a handle for rendering the
/// scrape output. The API layer serves it at `/metrics`. Calling this more
/// than once returns the handle installed first.
pub fn init_metrics() -> PrometheusHandle {
    PROM_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus metrics recorder")
        })
        .clone()
}
