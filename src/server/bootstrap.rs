use super::{run_admin_server, AdminState};
use crate::admission::AdmissionPipeline;
use crate::billing::BillingGateway;
use crate::concurrency::ConcurrencyManager;
use crate::config::AdmissionConfig;
use crate::forwarder::{Forwarder, NullForwarder, NullSyntheticResponder, SyntheticResponder};
use crate::kvstore::{KvStore, RedisStore};
use crate::metrics::Metrics;
use crate::selector::AccountSelector;
use crate::store::{EntityStore, HttpEntityStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub redis_url: Option<String>,
    pub admin_listen: Option<String>,
}

/// Core lifecycle: init → connect → wire pipeline → serve admin → shutdown.
///
/// The `Forwarder` wired in here is [`NullForwarder`] — actual upstream
/// proxying is explicitly out of scope for this crate (§1); a real gateway
/// binary embedding this core replaces `build_pipeline` with its own
/// `Forwarder`/`SyntheticResponder` before calling `admit()`.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = AdmissionConfig::load(&args.config_path)?;
    if let Some(url) = args.redis_url {
        config.redis.url = url;
    }
    if let Some(listen) = args.admin_listen {
        config.admin.listen = listen;
    }

    let metrics = Metrics::install();

    let kv: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&config.redis.url).await?);
    let entity_store: Arc<dyn EntityStore> = Arc::new(HttpEntityStore::new(
        config.entity_store.base_url.clone(),
        Duration::from_secs(config.entity_store.request_timeout_seconds),
    )?);
    let billing: Arc<dyn BillingGateway> = Arc::new(
        crate::billing::HttpBillingGateway::new(
            config.billing.base_url.clone(),
            Duration::from_secs(config.billing.request_timeout_seconds),
        )
        .map_err(anyhow::Error::msg)?,
    );
    let forwarder: Arc<dyn Forwarder> = Arc::new(NullForwarder::default());
    let synthetic: Arc<dyn SyntheticResponder> = Arc::new(NullSyntheticResponder);

    let pipeline = Arc::new(build_pipeline(
        &config,
        kv.clone(),
        entity_store,
        billing,
        forwarder,
        synthetic,
    ));

    let shutdown = Arc::new(Notify::new());

    start_idle_cleaner(&config, kv.clone(), &shutdown);

    let admin_state = AdminState::new(config.clone(), metrics, kv, pipeline);
    let admin_handle = tokio::spawn({
        let listen = config.admin.listen.clone();
        let shutdown = shutdown.clone();
        async move { run_admin_server(&listen, admin_state, shutdown).await }
    });

    tracing::info!("server: admission core started, admin_listen={}", config.admin.listen);

    wait_for_shutdown(&shutdown).await;

    if let Err(e) = admin_handle.await {
        tracing::error!("server: admin task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_pipeline(
    config: &AdmissionConfig,
    kv: Arc<dyn KvStore>,
    entity_store: Arc<dyn EntityStore>,
    billing: Arc<dyn BillingGateway>,
    forwarder: Arc<dyn Forwarder>,
    synthetic: Arc<dyn SyntheticResponder>,
) -> AdmissionPipeline {
    let concurrency = Arc::new(ConcurrencyManager::new(
        kv.clone(),
        config.concurrency.clone(),
        config.wait_queue.clone(),
        config.backoff.clone(),
    ));
    let selector = Arc::new(AccountSelector::new(
        entity_store,
        kv.clone(),
        concurrency.clone(),
        config.concurrency.clone(),
        config.load_balancing.clone(),
    ));

    AdmissionPipeline::new(
        concurrency,
        selector,
        billing,
        forwarder,
        synthetic,
        kv,
        config.concurrency.clone(),
        config.wait_queue.clone(),
        config.backoff.clone(),
        config.failover.clone(),
        config.load_balancing.clone(),
        config.user_input_pacing.clone(),
    )
}

fn start_idle_cleaner(config: &AdmissionConfig, kv: Arc<dyn KvStore>, shutdown: &Arc<Notify>) {
    let slot_ttl = Duration::from_secs(config.concurrency.slot_ttl_minutes * 60);
    let interval = Duration::from_secs(config.admin.cleanup_interval_seconds);
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        crate::cleaner::run(kv, slot_ttl, interval, shutdown).await;
    });
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
