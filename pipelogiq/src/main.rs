// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipelogiq Control Plane Binary
//!
//! Composition root: loads configuration, wires the state store, broker
//! client, scheduler, reconciler, job gateway, worker registry, and the
//! two HTTP surfaces, then supervises them until a shutdown signal.
//!
//! Exit codes follow `sysexits.h`: 0 on graceful shutdown, 78 on a
//! configuration error, 73 when a listening socket cannot bind, 69 when a
//! required backend is unreachable, 70 on internal failure.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};

use pipelogiq_bootstrap::logger::init_tracing;
use pipelogiq_bootstrap::{signals, ExitCode, ShutdownCoordinator};
use pipelogiq_domain::repositories::StateStore;
use pipelogiq_domain::value_objects::QueueTopology;
use pipelogiq_domain::PipelineError;

use pipelogiq::application::gateway::JobSource;
use pipelogiq::application::reconciler::{StageResultHandler, StageSetStatusHandler};
use pipelogiq::application::services::{PipelineService, WorkerRegistry};
use pipelogiq::application::{JobGateway, Reconciler, Scheduler};
use pipelogiq::infrastructure::alerts::FanoutAlertSink;
use pipelogiq::infrastructure::broker::BrokerClient;
use pipelogiq::infrastructure::config::{AppConfig, DatabaseDriver, VersionInfo};
use pipelogiq::infrastructure::metrics::MetricsService;
use pipelogiq::infrastructure::repositories::{PostgresStateStore, SqliteStateStore};
use pipelogiq::infrastructure::runtime::{join_supervised, spawn_supervised};
use pipelogiq::presentation::http::{serve_external, serve_internal, AppState};

#[derive(Parser)]
#[command(name = "pipelogiq", version, about = "Pipelogiq workflow control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        /// Path to a TOML configuration file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Create the embedded SQLite schema and exit (development helper).
    InitDb {
        /// Path to a TOML configuration file.
        #[arg(long)]
        config: Option<String>,
    },
}

fn exit_code_for(err: &PipelineError) -> ExitCode {
    match err {
        PipelineError::InvalidConfiguration(_) => ExitCode::ConfigError,
        PipelineError::IoError(_) => ExitCode::CantCreate,
        PipelineError::DatabaseError(_) | PipelineError::BrokerError(_) | PipelineError::TimeoutError(_) => {
            ExitCode::Unavailable
        }
        _ => ExitCode::Software,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve { config } => run_serve(config.as_deref()).await,
        Command::InitDb { config } => run_init_db(config.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::Success.exit(),
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("pipelogiq: {}", e);
            exit_code_for(&e).exit()
        }
    }
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn StateStore>, PipelineError> {
    match config.database.driver {
        DatabaseDriver::Sqlite => Ok(Arc::new(SqliteStateStore::connect(&config.database.url).await?)),
        DatabaseDriver::Postgres => Ok(Arc::new(PostgresStateStore::connect(&config.database.url).await?)),
    }
}

async fn run_init_db(config_path: Option<&str>) -> Result<(), PipelineError> {
    let config = AppConfig::load(config_path)?;
    let _ = init_tracing(config.log_level());

    match config.database.driver {
        DatabaseDriver::Sqlite => {
            SqliteStateStore::connect(&config.database.url).await?;
            info!(url = %config.database.url, "sqlite schema created");
            Ok(())
        }
        DatabaseDriver::Postgres => Err(PipelineError::invalid_config(
            "the postgres schema is managed by the external migration tool",
        )),
    }
}

async fn run_serve(config_path: Option<&str>) -> Result<(), PipelineError> {
    let config = AppConfig::load(config_path)?;
    init_tracing(config.log_level()).map_err(PipelineError::invalid_config)?;

    let version = VersionInfo::current();
    info!(version = %version.version, commit = %version.commit, "pipelogiq starting");

    let metrics = MetricsService::new()?;
    let topology = QueueTopology::new(config.broker.app_runtime_id.clone());

    let store = build_store(&config).await?;
    let broker = Arc::new(BrokerClient::connect(config.broker.clone(), topology.clone()).await?);
    store.set_alert_sink(Arc::new(FanoutAlertSink::new(broker.clone())));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        broker.clone(),
        metrics.clone(),
        config.scheduler.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(store.clone(), metrics.clone()));
    let gateway = Arc::new(JobGateway::new(
        broker.clone() as Arc<dyn JobSource>,
        config.gateway.clone(),
        metrics.clone(),
    ));
    let registry = Arc::new(WorkerRegistry::new(
        store.clone(),
        topology.clone(),
        broker.url().to_string(),
        config.worker.clone(),
    ));
    let pipeline_service = Arc::new(PipelineService::new(store.clone(), broker.clone(), metrics.clone()));

    let app_state = AppState {
        store: store.clone(),
        pipeline_service,
        registry,
        gateway: gateway.clone(),
        metrics: metrics.clone(),
        version,
        auth: config.auth.clone(),
        broker_url: broker.url().to_string(),
    };

    let coordinator = ShutdownCoordinator::default();

    let mut handles = Vec::new();

    {
        let scheduler = scheduler.clone();
        let token = coordinator.token();
        let drain = coordinator.register("scheduler");
        handles.push(spawn_supervised("scheduler", async move {
            let _drain = drain;
            scheduler.run(token).await
        }));
    }
    {
        let scheduler = scheduler.clone();
        let token = coordinator.token();
        let drain = coordinator.register("pending-watchdog");
        handles.push(spawn_supervised("pending-watchdog", async move {
            let _drain = drain;
            scheduler.run_watchdog(token).await
        }));
    }
    {
        let broker = broker.clone();
        let handler = Arc::new(StageResultHandler(reconciler.clone()));
        let token = coordinator.token();
        let drain = coordinator.register("stage-result-consumer");
        handles.push(spawn_supervised("stage-result-consumer", async move {
            let _drain = drain;
            let queue = broker.topology().stage_result_queue();
            broker.consume(queue, "pipelogiq-stage-result", handler, token).await
        }));
    }
    {
        let broker = broker.clone();
        let handler = Arc::new(StageSetStatusHandler(reconciler.clone()));
        let token = coordinator.token();
        let drain = coordinator.register("stage-set-status-consumer");
        handles.push(spawn_supervised("stage-set-status-consumer", async move {
            let _drain = drain;
            let queue = broker.topology().stage_set_status_queue();
            broker.consume(queue, "pipelogiq-stage-set-status", handler, token).await
        }));
    }
    {
        let gateway = gateway.clone();
        let token = coordinator.token();
        let drain = coordinator.register("gateway-sweeper");
        handles.push(spawn_supervised("gateway-sweeper", async move {
            let _drain = drain;
            gateway.run_sweeper(token).await
        }));
    }
    {
        let state = app_state.clone();
        let bind = config.server.internal_bind.clone();
        let timeout = config.server.request_timeout();
        let token = coordinator.token();
        let drain = coordinator.register("internal-http");
        handles.push(spawn_supervised("internal-http", async move {
            let _drain = drain;
            serve_internal(state, bind, timeout, token).await
        }));
    }
    {
        let state = app_state.clone();
        let bind = config.server.external_bind.clone();
        let timeout = config.server.request_timeout();
        let token = coordinator.token();
        let drain = coordinator.register("external-http");
        handles.push(spawn_supervised("external-http", async move {
            let _drain = drain;
            serve_external(state, bind, timeout, token).await
        }));
    }

    let mut all_tasks = Box::pin(futures::future::try_join_all(
        handles.into_iter().map(join_supervised),
    ));

    tokio::select! {
        _ = signals::wait_for_shutdown_signal(&coordinator) => {
            // Tasks observe the cancelled token and drop their drain
            // guards as they return; the coordinator bounds the wait and
            // names any task that fails to wind down.
            if coordinator.wait_for_drain().await {
                match (&mut all_tasks).await {
                    Ok(_) => info!("all tasks stopped"),
                    Err(e) => error!(error = %e, "task failed during shutdown"),
                }
            } else {
                error!(still_running = ?coordinator.pending_tasks(), "forcing exit with tasks still running");
            }
            info!("shutdown complete");
            Ok(())
        }
        result = &mut all_tasks => {
            // A supervised task died before any signal; bring the rest down.
            coordinator.initiate_shutdown();
            match result {
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        }
    }
}
