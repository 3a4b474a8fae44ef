//! Main controller implementation.
//!
//! Builds the backends, the pool index and the two work queues, then runs
//! the watchers, the node and pool workers and the probe server side by side.

use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::credentials::SecretCredentialResolver;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::pool_index::PoolIndex;
use crate::reconciler::{Backends, Reconciler};
use crate::runtime::KubeRuntime;
use crate::scheduler::WorkQueue;
use crate::server::{self, ProbeState};
use crate::store::KubeStore;
use crate::watcher::Watcher;
use crds::{BamelAutoscaler, BareMetalNode};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use power_driver::{DriverConfig, DriverSet};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::task::JoinHandle;
use tracing::{error, info};

type Task = JoinHandle<Result<(), ControllerError>>;

/// Main controller for bare-metal node lifecycle and pool autoscaling.
pub struct Controller {
    node_queue: Arc<WorkQueue<String>>,
    pool_queue: Arc<WorkQueue<String>>,
    node_watcher: Task,
    policy_watcher: Task,
    runtime_watcher: Task,
    node_workers: JoinHandle<()>,
    pool_workers: JoinHandle<()>,
    probe_server: Task,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing Bamel controller");

        let client = Client::try_default().await?;
        let metrics = Arc::new(Metrics::new()?);

        let backoff = ExponentialBackoff::new(config.backoff_min, config.backoff_max);
        let node_queue = Arc::new(WorkQueue::new("node", backoff).with_metrics(metrics.clone()));
        let pool_queue = Arc::new(WorkQueue::new("pool", backoff).with_metrics(metrics.clone()));

        // Every index change wakes the autoscaler for that pool.
        let index = {
            let pool_queue = pool_queue.clone();
            Arc::new(PoolIndex::with_listener(move |pool| pool_queue.add(pool.to_string())))
        };

        let drivers = DriverSet::new(&DriverConfig {
            redfish_insecure_tls: config.redfish_insecure_tls,
            ..DriverConfig::default()
        })?;
        let store = Arc::new(KubeStore::new(client.clone()));
        let backends = Backends {
            nodes: store.clone(),
            policies: store,
            power: Arc::new(drivers),
            runtime: Arc::new(KubeRuntime::new(client.clone())),
            credentials: Arc::new(SecretCredentialResolver::new(client.clone(), &config.credentials_namespace)),
        };
        let reconciler = Arc::new(Reconciler::new(backends, index.clone(), config.clone(), metrics.clone()));

        let ready = Arc::new(AtomicBool::new(false));
        let watcher = Arc::new(Watcher::new(index, node_queue.clone(), pool_queue.clone(), ready.clone()));

        let node_watcher = {
            let watcher = watcher.clone();
            let api: Api<BareMetalNode> = Api::all(client.clone());
            tokio::spawn(async move { watcher.watch_nodes(api).await })
        };
        let policy_watcher = {
            let watcher = watcher.clone();
            let api: Api<BamelAutoscaler> = Api::all(client.clone());
            tokio::spawn(async move { watcher.watch_policies(api).await })
        };
        let runtime_watcher = {
            let api: Api<Node> = Api::all(client);
            tokio::spawn(async move { watcher.watch_runtime_nodes(api).await })
        };

        let node_workers = {
            let reconciler = reconciler.clone();
            tokio::spawn(node_queue.clone().run(
                config.node_workers,
                config.reconcile_timeout,
                move |name: String| {
                    let reconciler = reconciler.clone();
                    async move { reconciler.reconcile_node(&name).await }
                },
            ))
        };
        let pool_workers = tokio::spawn(pool_queue.clone().run(
            config.pool_workers,
            config.reconcile_timeout,
            move |pool: String| {
                let reconciler = reconciler.clone();
                async move { reconciler.reconcile_pool(&pool).await }
            },
        ));

        let probe_server = tokio::spawn(server::serve(config.probe_addr, ProbeState { ready, metrics }));

        Ok(Self {
            node_queue,
            pool_queue,
            node_watcher,
            policy_watcher,
            runtime_watcher,
            node_workers,
            pool_workers,
            probe_server,
        })
    }

    /// Runs the controller until a task exits or the process is interrupted.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Bamel controller running");

        let outcome = tokio::select! {
            result = &mut self.node_watcher => task_result("BareMetalNode watcher", result),
            result = &mut self.policy_watcher => task_result("BamelAutoscaler watcher", result),
            result = &mut self.runtime_watcher => task_result("Node watcher", result),
            result = &mut self.probe_server => task_result("probe server", result),
            result = &mut self.node_workers => {
                result.map_err(|e| ControllerError::Watch(format!("node workers panicked: {e}")))
            }
            result = &mut self.pool_workers => {
                result.map_err(|e| ControllerError::Watch(format!("pool workers panicked: {e}")))
            }
            signal = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                signal.map_err(ControllerError::from)
            }
        };

        self.shutdown().await;
        if let Err(e) = &outcome {
            error!(error = %e, "Controller stopped");
        }
        outcome
    }

    /// Stop handing out work and let in-flight reconciliations finish.
    async fn shutdown(self) {
        self.node_queue.shutdown();
        self.pool_queue.shutdown();
        self.node_watcher.abort();
        self.policy_watcher.abort();
        self.runtime_watcher.abort();
        self.probe_server.abort();
        for (name, workers) in [("node", self.node_workers), ("pool", self.pool_workers)] {
            // A handle that already resolved in `run` must not be polled again.
            if workers.is_finished() {
                continue;
            }
            if let Err(e) = workers.await {
                error!(queue = name, error = %e, "Workers did not stop cleanly");
            }
        }
        info!("Bamel controller stopped");
    }
}

fn task_result(
    task: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    result.map_err(|e| ControllerError::Watch(format!("{task} panicked: {e}")))?
}
