//! The assembled aggregation engine.
//!
//! Starting an [`Engine`] builds, per metric type and level, a role, its
//! worker instances with their consumer tasks, the routing registry, one
//! downsampling graph per metric type, the flush timer and, in cluster mode,
//! the remote dispatch server with the forwarder of the remote stages.

use super::graph::DownsamplingGraph;
use super::timer::{self, PersistenceTimer};
use super::worker::{FlushReport, PersistenceWorker, WorkerConfig};
use crate::cluster::{
    Registry, RemoteForwarder, RemoteSender, RemoteServer, Role, TcpRemoteSender, WorkerRef,
};
use crate::core::{Config, Result, StrataError};
use crate::metrics::{catalog, DownSampling, Metric, MetricDefine};
use crate::storage::{BatchDao, RetryingBatchDao, StorageProvider};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Configures and starts an [`Engine`].
pub struct EngineBuilder {
    config: Config,
    storage: Arc<dyn StorageProvider>,
    defines: Vec<&'static MetricDefine>,
    sender: Option<Arc<dyn RemoteSender>>,
}

impl EngineBuilder {
    /// Aggregate `define`. Without any, every built-in metric type is used.
    pub fn metric(mut self, define: &'static MetricDefine) -> Self {
        self.defines.push(define);
        self
    }

    /// Use `sender` for remote dispatch instead of TCP.
    pub fn remote_sender(mut self, sender: Arc<dyn RemoteSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub async fn start(self) -> Result<Engine> {
        let EngineBuilder {
            config,
            storage,
            mut defines,
            sender,
        } = self;
        config.validate()?;
        if defines.is_empty() {
            defines = catalog::all();
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        match assemble(&config, storage, &defines, sender, &shutdown_rx).await {
            Ok(parts) => Ok(Engine::from_parts(config, parts, shutdown, &shutdown_rx)),
            Err(e) => {
                // Stop whatever already started.
                let _ = shutdown.send(true);
                Err(e)
            },
        }
    }
}

struct Parts {
    registry: Arc<Registry>,
    graphs: FxHashMap<&'static str, DownsamplingGraph>,
    workers: Vec<Arc<PersistenceWorker>>,
    consumers: Vec<JoinHandle<()>>,
    server: Option<(SocketAddr, RemoteServer)>,
}

async fn assemble(
    config: &Config,
    storage: Arc<dyn StorageProvider>,
    defines: &[&'static MetricDefine],
    sender: Option<Arc<dyn RemoteSender>>,
    shutdown: &watch::Receiver<bool>,
) -> Result<Parts> {
    let batch_dao: Arc<dyn BatchDao> = Arc::new(RetryingBatchDao::new(
        storage.batch_dao(),
        config.storage.retry.clone(),
    ));
    let cluster = &config.cluster;
    let members = cluster.sorted_members();

    let mut builder = Registry::builder();
    if !cluster.is_standalone() {
        let sender = sender.unwrap_or_else(|| {
            Arc::new(TcpRemoteSender::new(cluster)) as Arc<dyn RemoteSender>
        });
        builder = builder.remote_sender(sender);
    }

    let mut workers = Vec::new();
    let mut consumers = Vec::new();
    let mut levels_of = Vec::with_capacity(defines.len());

    for &define in defines {
        let name = define.name();
        let metric = config.metric(name);
        let worker_config = WorkerConfig::for_metric(config, name);
        let mut levels = metric.levels.clone();
        levels.sort();
        levels.dedup();

        for &level in &levels {
            let role = Role::new(name, level, metric.selector);
            let mut spawn_local = || {
                let worker = Arc::new(PersistenceWorker::new(
                    role.clone(),
                    define,
                    storage.persistence_dao(define, level),
                    Arc::clone(&batch_dao),
                    worker_config.clone(),
                ));
                let (handle, task) = worker.spawn(shutdown.clone());
                workers.push(worker);
                consumers.push(task);
                WorkerRef::Local(handle)
            };

            let instances: Vec<WorkerRef> = if cluster.is_standalone() {
                (0..metric.instances).map(|_| spawn_local()).collect()
            } else {
                let mut instances = Vec::with_capacity(members.len() * metric.instances);
                for (position, &member) in members.iter().enumerate() {
                    for i in 0..metric.instances {
                        if Some(member) == cluster.self_address {
                            instances.push(spawn_local());
                        } else {
                            let index = position * metric.instances + i;
                            let instance = u32::try_from(index).map_err(|_| {
                                StrataError::config(format!("too many instances for {}", role))
                            })?;
                            instances.push(WorkerRef::Remote {
                                address: member,
                                instance,
                            });
                        }
                    }
                }
                instances
            };
            builder = builder.role(role, instances)?;
        }
        levels_of.push((define, levels));
    }

    let registry = Arc::new(builder.build());

    let mut graphs = FxHashMap::default();
    for (define, levels) in levels_of {
        let graph = DownsamplingGraph::build(define, &levels, Arc::clone(&registry))?;
        graphs.insert(define.name(), graph);
    }

    let server = match cluster.self_address {
        Some(address) if !cluster.is_standalone() => {
            let server = RemoteServer::bind(address, Arc::clone(&registry)).await?;
            Some((server.local_addr()?, server))
        },
        _ => None,
    };

    Ok(Parts {
        registry,
        graphs,
        workers,
        consumers,
        server,
    })
}

/// Running aggregation engine.
pub struct Engine {
    config: Config,
    registry: Arc<Registry>,
    graphs: FxHashMap<&'static str, DownsamplingGraph>,
    workers: Vec<Arc<PersistenceWorker>>,
    consumers: Vec<JoinHandle<()>>,
    timer: PersistenceTimer,
    forwarder: Option<RemoteForwarder>,
    server: Option<(SocketAddr, JoinHandle<Result<()>>)>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn builder(config: Config, storage: Arc<dyn StorageProvider>) -> EngineBuilder {
        EngineBuilder {
            config,
            storage,
            defines: Vec::new(),
            sender: None,
        }
    }

    /// Start with every built-in metric type.
    pub async fn start(config: Config, storage: Arc<dyn StorageProvider>) -> Result<Engine> {
        Self::builder(config, storage).start().await
    }

    fn from_parts(
        config: Config,
        parts: Parts,
        shutdown: watch::Sender<bool>,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Self {
        let timer = PersistenceTimer::start(&parts.workers, shutdown_rx);
        let forwarder = (!config.cluster.is_standalone()).then(|| {
            RemoteForwarder::start(
                Arc::clone(&parts.registry),
                config.cluster.forward_interval,
                shutdown_rx,
            )
        });
        let server = parts
            .server
            .map(|(address, server)| (address, tokio::spawn(server.serve(shutdown_rx.clone()))));

        info!(
            roles = parts.registry.roles().count(),
            workers = parts.workers.len(),
            standalone = config.cluster.is_standalone(),
            "Engine started"
        );

        Self {
            config,
            registry: parts.registry,
            graphs: parts.graphs,
            workers: parts.workers,
            consumers: parts.consumers,
            timer,
            forwarder,
            server,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Local workers, in start order.
    pub fn workers(&self) -> &[Arc<PersistenceWorker>] {
        &self.workers
    }

    /// Local workers of one metric type at one level.
    pub fn workers_of(&self, metric_type: &str, level: DownSampling) -> Vec<Arc<PersistenceWorker>> {
        let role = Role::name_of(metric_type, level);
        self.workers
            .iter()
            .filter(|worker| worker.role().name() == role)
            .map(Arc::clone)
            .collect()
    }

    /// Address the remote dispatch server listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|(address, _)| *address)
    }

    /// Feed a minute record into the downsampling graph of its type.
    pub async fn ingest(&self, metric: Metric) -> Result<()> {
        let name = metric.define().name();
        let graph = self
            .graphs
            .get(name)
            .ok_or_else(|| StrataError::UnknownMetric(name.to_string()))?;
        graph.accept(metric).await
    }

    /// Hand a record to one role directly, bypassing the graph.
    pub async fn dispatch(&self, role: &str, metric: Metric) -> Result<()> {
        self.registry.dispatch(role, metric).await
    }

    /// Flush every local worker now.
    pub async fn flush_all(&self) -> Vec<(String, Result<FlushReport>)> {
        timer::flush_all(&self.workers).await
    }

    /// Stop timers and the server, drain the queues and flush one last time.
    pub async fn shutdown(self) -> Result<()> {
        info!("Engine shutting down");
        // Receivers live as long as the tasks; a send error only means all are gone.
        let _ = self.shutdown.send(true);

        self.timer.join().await;
        if let Some(forwarder) = self.forwarder {
            forwarder.join().await;
        }
        for consumer in self.consumers {
            if let Err(e) = consumer.await {
                error!("Worker consumer task failed: {}", e);
            }
        }
        if let Some((_, server)) = self.server {
            server.await??;
        }

        info!("Engine stopped");
        Ok(())
    }
}
