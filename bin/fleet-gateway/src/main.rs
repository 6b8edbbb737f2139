use anyhow::Result;
use fleet_core::{
    HealthChecker, HttpProber, JsonFileStore, Prober, RegistryStore, ServiceRegistry, TcpProber,
};
use fleet_proxy::{MetricsCollector, RequestForwarder, RoutingTable};
use fleet_sync::ProxyDiscoveryIntegrator;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod logging;
mod server;

use config::{GatewayConfig, ProberKind};
use server::GatewayState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::load()?;
    logging::init(&config.log_level, config.log_format);

    info!("Starting fleet-gateway...");

    let cancel = CancellationToken::new();

    // Stopped by `shutdown`, after the server and health checker
    let registry = ServiceRegistry::new(config.registry_config());
    let store = config.registry.store_path.as_ref().map(JsonFileStore::new);
    info!("Service registry initialized");

    let metrics = MetricsCollector::new()?;
    let table = Arc::new(RoutingTable::new(config.sync.load_balancing));
    info!(
        "Routing table initialized ({:?} load balancing)",
        table.strategy()
    );

    let integrator = Arc::new(
        ProxyDiscoveryIntegrator::new(
            &registry,
            table.clone(),
            config.sync_config(),
            Some(metrics.clone()),
        )
        .await,
    );
    for binding in &config.routes {
        integrator
            .add_service_route(&binding.service, &binding.path)
            .await;
    }
    // Must run before restore and seeding: the subscription buffer is bounded.
    // Ends when the registry closes the stream, after the shutdown deregistrations.
    let sync_task = integrator.start(CancellationToken::new());

    if let Some(store) = &store {
        match registry.restore_from(store).await {
            Ok(restored) => info!(
                "Restored {} registrations from {}",
                restored,
                store.path().display()
            ),
            Err(e) => warn!("Failed to restore registrations: {}", e),
        }
    }

    for seed in &config.services {
        let (instance, options) = seed.to_registration();
        let id = instance.id.clone();
        match registry.register(instance, options).await {
            Ok(()) => info!(service_id = %id, "Registered seed service {}", seed.name),
            Err(e) if config.fail_on_registration_error => {
                error!(service_id = %id, "Failed to register seed service: {}", e);
                return Err(e.into());
            }
            Err(e) => warn!(service_id = %id, "Skipping seed service: {}", e),
        }
    }

    let prober: Arc<dyn Prober> = match config.health.prober {
        ProberKind::Tcp => Arc::new(TcpProber),
        ProberKind::Http => Arc::new(HttpProber::new(config.health.http_path.clone())),
    };
    let checker = Arc::new(HealthChecker::new(
        registry.clone(),
        prober,
        config.health_config(),
    ));
    info!("Health checker initialized ({:?} prober)", config.health.prober);

    let sweep_task = registry.start_expiry_sweep();
    let health_task = checker.start(cancel.child_token());

    let forwarder = Arc::new(RequestForwarder::new(config.forward_timeout()));
    info!(
        "Request forwarder initialized with {:?} timeout",
        forwarder.timeout()
    );

    let state = Arc::new(GatewayState {
        registry: registry.clone(),
        table,
        integrator,
        checker,
        forwarder,
        metrics,
        started_at: Instant::now(),
    });

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    tokio::select! {
        result = server::serve(listener, state, cancel.clone()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    cancel.cancel();
    shut_down(
        &registry,
        store.as_ref().map(|s| s as &dyn RegistryStore),
        health_task,
        sync_task,
        sweep_task,
    )
    .await;

    info!("fleet-gateway stopped");
    Ok(())
}

/// Stop background work once the server is down. The snapshot is taken
/// before local instances are deregistered, and the sync task only ends
/// after it has applied those deregistrations.
async fn shut_down(
    registry: &ServiceRegistry,
    store: Option<&dyn RegistryStore>,
    health_task: JoinHandle<()>,
    sync_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
) {
    if let Err(e) = health_task.await {
        warn!("Health checker task failed: {}", e);
    }

    if let Some(store) = store {
        if let Err(e) = registry.persist_to(store).await {
            warn!("Failed to persist registrations: {}", e);
        }
    }
    registry.shutdown().await;

    if let Err(e) = sync_task.await {
        warn!("Discovery sync task failed: {}", e);
    }
    if let Err(e) = sweep_task.await {
        warn!("Expiry sweep task failed: {}", e);
    }
}
