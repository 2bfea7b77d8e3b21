//! Daemon wiring.
//!
//! [`Fleet`] assembles every subsystem over one state store. [`run`]
//! opens the store in the data directory, resumes interrupted
//! operations, runs the rollout controller and stops on Ctrl-C.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use fleet_core::FleetConfig;
use fleet_orchestrator::{DryRunDriver, ExecutionEngine, Orchestrator};
use fleet_rollout::RolloutController;
use fleet_scheduler::Scheduler;
use fleet_state::{
    Cluster, ComputeCapability, DeploymentPlan, Ledger, MetaInstance, Node, StateStore,
};

/// All control plane subsystems sharing one state store.
#[derive(Clone)]
pub struct Fleet {
    pub store: StateStore,
    pub clusters: Ledger<Cluster>,
    pub capabilities: Ledger<ComputeCapability>,
    pub nodes: Ledger<Node>,
    pub plans: Ledger<DeploymentPlan>,
    pub instances: Ledger<MetaInstance>,
    pub scheduler: Scheduler,
    pub orchestrator: Orchestrator,
    pub rollout: RolloutController,
}

impl Fleet {
    pub fn assemble(store: StateStore, config: &FleetConfig) -> Self {
        let clusters = Ledger::with_default_transitions(store.clone());
        let capabilities = Ledger::with_default_transitions(store.clone());
        let nodes = Ledger::with_default_transitions(store.clone());
        let plans = Ledger::with_default_transitions(store.clone());
        let instances: Ledger<MetaInstance> = Ledger::with_default_transitions(store.clone());

        let scheduler = Scheduler::new(nodes.clone(), plans.clone(), instances.clone());
        let driver = Arc::new(DryRunDriver::new(instances.clone(), &config.driver));
        let engine = ExecutionEngine::new(store.clone());
        let orchestrator = Orchestrator::new(
            instances.clone(),
            scheduler.clone(),
            driver,
            engine,
            config.operations.clone(),
        );
        let rollout = RolloutController::new(
            plans.clone(),
            instances.clone(),
            orchestrator.clone(),
            &config.rollout,
            &config.operations,
        );

        Self {
            store,
            clusters,
            capabilities,
            nodes,
            plans,
            instances,
            scheduler,
            orchestrator,
            rollout,
        }
    }
}

/// Run the control plane until Ctrl-C.
pub async fn run(config: FleetConfig) -> anyhow::Result<()> {
    info!("fleet daemon starting");
    std::fs::create_dir_all(&config.daemon.data_dir)?;

    // ── State store ──────────────────────────────────────────────
    let db_path = config.database_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let fleet = Fleet::assemble(store, &config);
    info!(
        auto_approve = config.operations.auto_approve,
        "scheduler, orchestrator and rollout controller initialized"
    );

    // ── Crash recovery ───────────────────────────────────────────
    let resumed = fleet.orchestrator.resume_incomplete()?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "resumed interrupted operations");
    }

    // ── Background tasks ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rollout = fleet.rollout.clone();
    let rollout_handle = tokio::spawn(async move {
        rollout.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = rollout_handle.await;

    info!("fleet daemon stopped");
    Ok(())
}
