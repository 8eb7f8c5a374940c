//! Process wiring: transports, the service's domain, and its consumer tasks.
//!
//! Startup runs in two steps:
//! 1. [`Resources::from_config`] opens the broker channel (fatal if the retry budget is
//!    spent), the optional cloud bus and queue, and the marker store for the catalog.
//! 2. [`Service::from_parts`] builds the publisher, the domain operations and the router,
//!    then starts the supervised consumer loops.
//!
//! Tests call [`Service::from_parts`] directly with in-memory transports.
//!
//! Products, profiles and carts live in the in-memory repositories and start empty on
//! every launch. The catalog's Redis markers outlive the process, so after a restart an
//! order already marked processed is skipped even though the stock it reduced is gone.

use crate::catalog::{self, Catalog};
use crate::config::{ServiceConfig, ServiceKind};
use crate::customer::{self, Customers};
use crate::repository::{InMemoryCarts, InMemoryCustomers, InMemoryProducts};
use crate::shopping::{self, Shopping};
use anyhow::{Context, Result};
use shopwire_aws::{AwsSettings, EventBridgeBus, SqsQueue};
use shopwire_core::dead_letter::DeadLetterSink;
use shopwire_core::store::MarkerStore;
use shopwire_core::transport::{BrokerChannel, CloudBus, CloudQueue};
use shopwire_redis::RedisMarkerStore;
use shopwire_redpanda::RedpandaConnector;
use shopwire_runtime::supervisor::DEFAULT_RESTART_DELAY;
use shopwire_runtime::{
    BrokerDeadLetters, ConnectionManager, DualSinkPublisher, EventRouter, IdempotencyGuard, PullConsumer,
    PushConsumer, RetryPolicy, shutdown_within, supervise,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long consumer loops get to finish after shutdown is signalled.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Opened transports and stores.
#[derive(Clone)]
pub struct Resources {
    /// Shared broker channel
    pub channel: Arc<dyn BrokerChannel>,
    /// Cloud bus and the bus name to publish to
    pub cloud_bus: Option<(Arc<dyn CloudBus>, String)>,
    /// Cloud queue to long-poll
    pub cloud_queue: Option<Arc<dyn CloudQueue>>,
    /// Marker store for the idempotency guard
    pub markers: Option<Arc<dyn MarkerStore>>,
}

impl Resources {
    /// Resources with only a broker channel.
    #[must_use]
    pub fn broker_only(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            channel,
            cloud_bus: None,
            cloud_queue: None,
            markers: None,
        }
    }

    /// Open everything `config` asks for.
    ///
    /// # Errors
    ///
    /// Fails if the broker stays unreachable for the whole retry budget, or if the
    /// catalog's marker store cannot be opened.
    pub async fn from_config(config: &ServiceConfig) -> Result<Self> {
        let manager = ConnectionManager::new(Arc::new(RedpandaConnector::new()))
            .with_policy(RetryPolicy::fixed(config.broker.connect_attempts, config.broker.connect_interval));
        let channel = manager
            .connect(&config.broker.url, &config.broker.exchange)
            .await
            .context("Broker connection failed")?;
        let mut resources = Self::broker_only(channel);

        let cloud = &config.cloud;
        if cloud.event_bus.is_some() || cloud.queue_url.is_some() {
            let sdk = AwsSettings::new(&cloud.region).load().await;
            if let Some(bus) = &cloud.event_bus {
                info!(bus = %bus, region = %cloud.region, "Cloud bus configured");
                let sink: Arc<dyn CloudBus> = Arc::new(EventBridgeBus::new(&sdk));
                resources.cloud_bus = Some((sink, bus.clone()));
            }
            if let Some(url) = &cloud.queue_url {
                info!(queue_url = %url, "Cloud queue configured");
                let queue: Arc<dyn CloudQueue> = Arc::new(SqsQueue::new(&sdk, url.clone()));
                resources.cloud_queue = Some(queue);
            }
        }

        if config.service == ServiceKind::Catalog {
            let store = RedisMarkerStore::new(&config.redis_url)
                .await
                .context("Marker store connection failed")?;
            info!("Marker store connected");
            resources.markers = Some(Arc::new(store));
        }

        Ok(resources)
    }
}

/// Producer-side operations of the running service.
#[derive(Clone)]
pub enum Domain {
    /// Catalog operations
    Catalog(Arc<Catalog>),
    /// Customer operations
    Customer(Arc<Customers>),
    /// Shopping operations
    Shopping(Arc<Shopping>),
}

/// A running service: its domain plus supervised consumer loops.
pub struct Service {
    kind: ServiceKind,
    domain: Domain,
    publisher: Arc<DualSinkPublisher>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Build the service and start its consumers.
    ///
    /// Domain state is held in memory and is not durable; see the module docs.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the catalog is started without a marker store.
    pub fn from_parts(config: &ServiceConfig, resources: Resources) -> Result<Self> {
        let kind = config.service;
        let mut publisher = DualSinkPublisher::new(Arc::clone(&resources.channel), kind.as_str());
        match resources.cloud_bus.clone() {
            Some((bus, name)) => publisher = publisher.with_cloud_bus(bus, name),
            None => info!(service = %kind, "Cloud bus not configured, publishing to the broker only"),
        }
        let publisher = Arc::new(publisher);

        let (domain, router) = match kind {
            ServiceKind::Catalog => {
                let markers = resources
                    .markers
                    .clone()
                    .context("The catalog needs a marker store")?;
                let products = Arc::new(InMemoryProducts::new());
                let router = catalog::router(products.clone(), IdempotencyGuard::new(markers));
                (Domain::Catalog(Arc::new(Catalog::new(products, Arc::clone(&publisher)))), router)
            }
            ServiceKind::Customer => {
                let customers = Arc::new(Customers::new(Arc::new(InMemoryCustomers::new()), Arc::clone(&publisher)));
                let router = customer::router(Arc::clone(&customers));
                (Domain::Customer(customers), router)
            }
            ServiceKind::Shopping => {
                let carts = Arc::new(InMemoryCarts::new());
                let router = shopping::router(carts.clone());
                (Domain::Shopping(Arc::new(Shopping::new(carts, Arc::clone(&publisher)))), router)
            }
        };
        let router = Arc::new(router.with_timeout(config.handler.timeout));

        let (shutdown, _) = broadcast::channel(16);
        let mut tasks = vec![spawn_push(config, &resources, &router, &shutdown)];
        match &resources.cloud_queue {
            Some(queue) => tasks.push(spawn_pull(config, &resources, Arc::clone(queue), &router, &shutdown)),
            None => warn!(service = %kind, "Cloud queue not configured, pull consumer disabled"),
        }

        info!(service = %kind, queue = %config.broker.queue, routes = ?router.routing_keys(), "Service started");
        Ok(Self {
            kind,
            domain,
            publisher,
            shutdown,
            tasks,
        })
    }

    /// Which service this is.
    #[must_use]
    pub const fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// Producer-side operations.
    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The service's publisher.
    #[must_use]
    pub fn publisher(&self) -> Arc<DualSinkPublisher> {
        Arc::clone(&self.publisher)
    }

    /// Signal shutdown and wait up to `grace` for the consumer loops.
    pub async fn shutdown(self, grace: Duration) {
        info!(service = %self.kind, "Shutting down");
        // No receivers left means every loop already stopped
        let _ = self.shutdown.send(());
        shutdown_within(self.tasks, grace).await;
        info!(service = %self.kind, "Shutdown complete");
    }

    /// Run until ctrl-c, then shut down.
    ///
    /// # Errors
    ///
    /// Fails if the signal handler cannot be installed.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
        info!("Received ctrl-c");
        self.shutdown(SHUTDOWN_GRACE).await;
        Ok(())
    }
}

fn dead_letters(resources: &Resources) -> Arc<dyn DeadLetterSink> {
    Arc::new(BrokerDeadLetters::new(Arc::clone(&resources.channel)))
}

fn spawn_push(
    config: &ServiceConfig,
    resources: &Resources,
    router: &Arc<EventRouter>,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let channel = Arc::clone(&resources.channel);
    let sink = dead_letters(resources);
    let router = Arc::clone(router);
    let queue = config.broker.queue.clone();
    let policy = RetryPolicy::builder()
        .max_attempts(config.handler.max_attempts)
        .initial_delay(Duration::from_secs(1))
        .max_delay(Duration::from_secs(10))
        .build();

    supervise(format!("push:{queue}"), shutdown, DEFAULT_RESTART_DELAY, move |rx| {
        PushConsumer::new(Arc::clone(&channel), queue.clone(), Arc::clone(&router), rx)
            .with_retry_policy(policy.clone())
            .with_dead_letters(Arc::clone(&sink))
            .run()
    })
}

fn spawn_pull(
    config: &ServiceConfig,
    resources: &Resources,
    queue: Arc<dyn CloudQueue>,
    router: &Arc<EventRouter>,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let sink = dead_letters(resources);
    let router = Arc::clone(router);
    let cloud = config.cloud.clone();

    supervise(format!("pull:{}", config.broker.queue), shutdown, DEFAULT_RESTART_DELAY, move |rx| {
        PullConsumer::new(Arc::clone(&queue), Arc::clone(&router), rx)
            .with_batch_size(cloud.batch_size)
            .with_wait(cloud.poll_wait)
            .with_max_receive_count(cloud.max_receive_count)
            .with_dead_letters(Arc::clone(&sink))
            .run()
    })
}
