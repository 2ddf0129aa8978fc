use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use collector_service::{
    api::{self, AppState},
    billing::BillingEngine,
    config::AppConfig,
    health::HealthMonitor,
    ingest::{HttpTelemetrySource, Ingestor},
    jobs,
    notify::{EmailNotifier, NotificationSink},
    observability,
    scheduler::{CollectionScheduler, SchedulerError},
};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    let metrics_handle = cfg
        .metrics
        .as_ref()
        .filter(|m| m.enabled)
        .map(|_| observability::init_metrics());

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;

    let source = Arc::new(HttpTelemetrySource::new(
        &cfg.telemetry.base_url,
        &cfg.telemetry.token,
        Duration::from_secs(cfg.telemetry.timeout_secs),
    )?);
    let ingestor = Arc::new(Ingestor::new(pool.clone(), source));

    // Pick up where a previous process left off if an active schedule exists.
    let scheduler = Arc::new(CollectionScheduler::new(pool.clone(), Arc::clone(&ingestor)));
    scheduler.resume().await?;

    let (sink, recipient): (Option<Arc<dyn NotificationSink>>, Option<String>) = match &cfg.email {
        Some(email) => (
            Some(Arc::new(EmailNotifier::new(email)?)),
            Some(email.alert_recipient.clone()),
        ),
        None => (None, None),
    };

    let billing = Arc::new(BillingEngine::new(pool.clone(), cfg.billing.tariff));
    let monitor = Arc::new(HealthMonitor::new(pool.clone(), &cfg.health, sink, recipient));

    let shutdown = CancellationToken::new();

    let billing_job = {
        let billing = Arc::clone(&billing);
        jobs::spawn_recurring(
            "billing",
            Duration::from_secs(cfg.billing.interval_minutes * 60),
            shutdown.clone(),
            move || {
                let billing = Arc::clone(&billing);
                async move {
                    for (year, month) in jobs::billing_periods(OffsetDateTime::now_utc()) {
                        billing.calculate_bill(year, month).await?;
                    }
                    Ok(())
                }
            },
        )
    };

    let health_job = {
        let monitor = Arc::clone(&monitor);
        jobs::spawn_recurring(
            "health",
            Duration::from_secs(cfg.health.interval_minutes * 60),
            shutdown.clone(),
            move || {
                let monitor = Arc::clone(&monitor);
                async move {
                    monitor.update_health().await?;
                    Ok(())
                }
            },
        )
    };

    let state = AppState {
        scheduler: Arc::clone(&scheduler),
        billing,
        metrics: metrics_handle,
    };

    let listener = tokio::net::TcpListener::bind(&cfg.http.bind_addr).await?;
    tracing::info!(addr = %cfg.http.bind_addr, "API server listening");

    axum::serve(listener, api::router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("shutting down");
    shutdown.cancel();
    let _ = billing_job.await;
    let _ = health_job.await;

    match scheduler.stop().await {
        Ok(_) | Err(SchedulerError::NotRunning) => {}
        Err(e) => tracing::warn!(error = %e, "failed to stop collection cleanly"),
    }

    Ok(())
}
