// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use clap::{Parser, ValueEnum};
use fleet_orchestrator::app::config::GlobalSettings;
use fleet_orchestrator::app::logging::setup_logging;
use fleet_orchestrator::common::retry::retry_async;
use fleet_orchestrator::domain::error::AppError;
use fleet_orchestrator::infrastructure::cache::{self, SharedCache};
use fleet_orchestrator::infrastructure::data::db::Database;
use fleet_orchestrator::infrastructure::data::submit::{ProtoSubmit, SubmitSettings};
use fleet_orchestrator::services::device::CommandMailbox;
use fleet_orchestrator::services::ingress::{IngressState, spawn_ingress};
use fleet_orchestrator::services::mapping::{
    ClientTls, MappingManager, MappingRpcClient, MappingService, spawn_mapping_rpc,
};
use fleet_orchestrator::services::mitm_mapper::{InProcessMitmMapper, RedisMitmMapper, SharedMitmMapper};
use fleet_orchestrator::services::processor::{DataProcessor, DataQueue, ProcessorPool, ProcessorSettings};
use fleet_orchestrator::services::stats::{StatsHandler, StatsSettings};
use fleet_orchestrator::services::status::{StatusBoard, spawn_status_server};
use fleet_orchestrator::services::strategy::{ScanServices, StrategySettings};
use fleet_orchestrator::services::worker::{DeviceSupervisor, SupervisorSettings};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RunMode {
    /// Ingress, processing, device workers and the mapping RPC.
    OnlyScan,
    /// Mapping service only, for hosts that serve mappings to the cluster.
    OnlyRoutes,
    /// Validate configuration and mappings, then exit.
    Config,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "device fleet scan orchestrator")]
struct Cli {
    /// Path to config file (default: config.{toml,yaml,...})
    #[arg(long)]
    config: Option<String>,

    #[arg(long, value_enum, default_value = "only-scan")]
    runmode: RunMode,

    /// MITM ingress listen address (overrides config/env)
    #[arg(long)]
    ingress_bind: Option<String>,

    /// Mapping RPC listen address (overrides config/env)
    #[arg(long)]
    mapping_rpc_bind: Option<String>,

    /// Status server port (overrides config/env)
    #[arg(long)]
    status_port: Option<u16>,

    /// Processor pool size (overrides config/env)
    #[arg(long)]
    workers: Option<usize>,

    /// Mappings file (overrides config/env)
    #[arg(long)]
    mappings: Option<String>,

    /// Emit JSON log lines
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, settings: &mut GlobalSettings) {
        if let Some(bind) = &self.ingress_bind {
            settings.ingress_bind = bind.clone();
        }
        if let Some(bind) = &self.mapping_rpc_bind {
            settings.mapping_rpc_bind = bind.clone();
        }
        if let Some(port) = self.status_port {
            settings.status_port = port;
        }
        if let Some(workers) = self.workers {
            settings.processor_workers = workers;
        }
        if let Some(path) = &self.mappings {
            settings.mappings_path = path.clone();
        }
        settings.log_json |= self.log_json;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Orchestrator stopped");
            eprintln!("fleet-orchestrator: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn connect_cache(settings: &GlobalSettings) -> Result<SharedCache, AppError> {
    let url = settings.redis_url_value();
    retry_async(
        |_| cache::connect(url.as_deref()),
        |e: &AppError| matches!(e, AppError::Connection(_) | AppError::Cache(_)),
        5,
        Duration::from_millis(500),
    )
    .await
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut settings = GlobalSettings::load_with_path(cli.config.as_deref())?;
    cli.apply(&mut settings);
    settings.validate()?;
    setup_logging(&settings.log_level_value(), settings.log_json);
    tracing::info!(
        instance = %settings.instance_name,
        language = %settings.language,
        runmode = ?cli.runmode,
        "Starting fleet orchestrator"
    );

    let db = Database::new(&settings.database_url()).await?;
    let remote_mapping = settings.mapping_rpc_url_value();
    let local_mapping = match &remote_mapping {
        Some(_) if cli.runmode == RunMode::OnlyScan => None,
        _ => Some(Arc::new(
            MappingManager::load(&settings.mappings_path, Some(db.clone())).await?,
        )),
    };

    if cli.runmode == RunMode::Config {
        tracing::info!(
            devices = local_mapping.as_ref().map_or(0, |m| m.devices().len()),
            "Configuration is valid"
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let mapping: Arc<dyn MappingService> = match (&local_mapping, &remote_mapping) {
        (Some(local), _) => local.clone() as Arc<dyn MappingService>,
        (None, Some(url)) => {
            let ttl = Duration::from_secs(180);
            tracing::info!(target: "mapping", url = %url, "Using remote mapping service");
            Arc::new(MappingRpcClient::new(url, ttl, &ClientTls::from_settings(&settings))?) as Arc<dyn MappingService>
        }
        (None, None) => return Err(AppError::Config("no mapping source configured".to_string())),
    };

    if local_mapping.is_some() {
        spawn_mapping_rpc(&settings.mapping_rpc_bind, mapping.clone(), shutdown.clone()).await?;
    }
    if cli.runmode == RunMode::OnlyRoutes {
        wait_for_signal().await;
        shutdown.cancel();
        return Ok(());
    }

    let cache = connect_cache(&settings).await?;
    let purge_task = tokio::spawn(cache::run_purge(
        cache.clone(),
        Duration::from_secs(60),
        shutdown.clone(),
    ));
    let mapper: SharedMitmMapper = if settings.redis_url_value().is_some() {
        Arc::new(RedisMitmMapper::new(cache.clone()))
    } else {
        Arc::new(InProcessMitmMapper::new())
    };
    let submit = ProtoSubmit::new(db.clone(), cache, SubmitSettings::from(&settings));
    let stats = Arc::new(StatsHandler::new(db.clone(), StatsSettings::from(&settings)));
    let stats_task = tokio::spawn(stats.clone().run(shutdown.clone()));

    let queue = Arc::new(DataQueue::new(settings.processor_queue_capacity));
    let processor = Arc::new(DataProcessor::new(
        mapper.clone(),
        submit.clone(),
        stats.clone(),
        mapping.clone(),
        ProcessorSettings::from(&settings),
    ));
    let metrics = processor.metrics();
    let pool = ProcessorPool::spawn(settings.processor_workers, processor, queue.clone());
    tracing::info!(target: "processor", workers = pool.workers(), "Processor pool started");

    let mailbox = Arc::new(CommandMailbox::new());
    let board = Arc::new(StatusBoard::new());
    let ingress = IngressState {
        queue: queue.clone(),
        mapper: mapper.clone(),
        mapping: mapping.clone(),
        mailbox: mailbox.clone(),
        metrics: metrics.clone(),
    };
    spawn_ingress(&settings.ingress_bind, ingress, shutdown.clone()).await?;
    spawn_status_server(
        settings.status_port,
        board.clone(),
        metrics,
        queue.clone(),
        shutdown.clone(),
    )
    .await;

    let mut supervisors = JoinSet::new();
    if let Some(local) = &local_mapping {
        let services = ScanServices {
            communicator: mailbox.clone(),
            mapper: mapper.clone(),
            submit: submit.clone(),
            stats: stats.clone(),
            status: board.clone(),
            settings: StrategySettings::from(&settings),
        };
        for device in local.devices() {
            let supervisor = DeviceSupervisor::new(
                &device.origin,
                local.clone(),
                services.clone(),
                SupervisorSettings::default(),
                shutdown.clone(),
            );
            supervisors.spawn(supervisor.run());
        }
        tracing::info!(target: "walker", devices = supervisors.len(), "Device supervisors started");
    }

    let failure = loop {
        tokio::select! {
            _ = wait_for_signal() => break None,
            joined = supervisors.join_next(), if !supervisors.is_empty() => match joined {
                Some(Ok(Err(e))) => break Some(e),
                Some(Err(e)) => tracing::error!(target: "walker", error = %e, "Device supervisor panicked"),
                _ => {}
            },
        }
    };

    tracing::info!("Shutting down");
    shutdown.cancel();
    if let Some(local) = &local_mapping {
        local.unload();
    }
    while let Some(joined) = supervisors.join_next().await {
        if let Ok(Err(e)) = joined {
            tracing::warn!(target: "walker", error = %e, "Device supervisor ended with error");
        }
    }
    pool.shutdown(Duration::from_secs(10)).await;
    if let Err(e) = stats_task.await {
        tracing::warn!(target: "stats", error = %e, "Stats task failed");
    }
    if let Err(e) = purge_task.await {
        tracing::warn!(target: "cache", error = %e, "Cache sweep task failed");
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
