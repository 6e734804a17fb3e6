use std::{future::Future, sync::Arc};

use anyhow::Context;
use futures_util::future::join_all;
use octorouter_db_memory::{MemoryStores, create_memory_stores};
use octorouter_lookup::{DirectorySource, TableRegistry};
use octorouter_pipeline::prelude::*;
use octorouter_pipeline::{ExpressionEngine, FilterEngine};
use octorouter_storage::{DynBlobStore, DynLineageStore, DynWorkQueue};
use tokio::{sync::watch, task::JoinHandle};

use crate::config::AppConfig;

/// The wired pipeline, ready to start its stage runners.
pub struct RouterServer {
    pipeline: Arc<PipelineContext>,
    stores: MemoryStores,
}

pub struct ServerBuilder {
    config: AppConfig,
    settings: Option<Arc<dyn SettingsProvider>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            settings: None,
            transport: None,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Use these settings instead of reading `settings.path`.
    pub fn with_settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub async fn build(self) -> anyhow::Result<RouterServer> {
        let cfg = self.config;
        let stores = create_memory_stores(
            cfg.storage
                .blob_base_url()
                .context("storage.blob_base_url")?,
        );

        let settings = match (self.settings, &cfg.settings.path) {
            (Some(settings), _) => settings,
            (None, Some(path)) => {
                let settings = InMemorySettings::from_toml_file(path)?;
                tracing::info!(
                    path = %path.display(),
                    senders = settings.senders().len(),
                    receivers = settings.receivers().len(),
                    "Settings loaded"
                );
                Arc::new(settings)
            }
            (None, None) => {
                tracing::warn!("settings.path is not set, no senders or receivers configured");
                Arc::new(InMemorySettings::empty())
            }
        };

        let tables = TableRegistry::new_shared();
        if let Some(dir) = &cfg.lookup.tables_dir {
            let loaded = tables
                .reload(&DirectorySource::new(dir))
                .await
                .with_context(|| format!("loading lookup tables from {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), tables = loaded, "Lookup tables loaded");
        }

        let expressions = match tables.get(&cfg.lookup.shorthand_table) {
            Some(table) => ExpressionEngine::from_shorthand_table(&table)?,
            None => {
                tracing::warn!(
                    table = %cfg.lookup.shorthand_table,
                    "Shorthand table not found, filters run without shorthands"
                );
                ExpressionEngine::new()
            }
        }
        .with_tables(tables.clone());
        if tables.get(&cfg.lookup.observation_mapping_table).is_none() {
            tracing::warn!(
                table = %cfg.lookup.observation_mapping_table,
                "Observation mapping table not found, convert will fail until it is loaded"
            );
        }

        let blobs: DynBlobStore = stores.blobs.clone();
        let queue: DynWorkQueue = stores.queue.clone();
        let lineage: DynLineageStore = stores.lineage.clone();
        let mut pipeline = PipelineContext::new(blobs, queue, lineage, settings)
            .with_tables(tables)
            .with_filters(FilterEngine::new(Arc::new(expressions)))
            .with_config(cfg.pipeline_settings());
        if let Some(transport) = self.transport {
            pipeline = pipeline.with_transport(transport);
        }

        Ok(RouterServer {
            pipeline: Arc::new(pipeline),
            stores,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_runner<S: Stage + 'static>(
    stage: S,
    pipeline: Arc<PipelineContext>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let runner = StageRunner::new(stage, pipeline);
    tokio::spawn(async move { runner.run(shutdown).await })
}

impl RouterServer {
    pub fn pipeline(&self) -> &Arc<PipelineContext> {
        &self.pipeline
    }

    pub fn stores(&self) -> &MemoryStores {
        &self.stores
    }

    /// Starts one runner task per stage.
    pub fn spawn_runners(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let p = &self.pipeline;
        vec![
            spawn_runner(ReceiveStage::new(p.clone()), p.clone(), shutdown.clone()),
            spawn_runner(ConvertStage::new(p.clone()), p.clone(), shutdown.clone()),
            spawn_runner(DestinationFilterStage::new(p.clone()), p.clone(), shutdown.clone()),
            spawn_runner(ReceiverFilterStage::new(p.clone()), p.clone(), shutdown.clone()),
            spawn_runner(TranslateStage::new(p.clone()), p.clone(), shutdown.clone()),
            spawn_runner(BatchStage::new(p.clone()), p.clone(), shutdown.clone()),
            spawn_runner(SendStage::new(p.clone()), p.clone(), shutdown),
        ]
    }

    /// Runs until ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `signal` completes, then stops the runners and waits for them.
    pub async fn run_until(self, signal: impl Future<Output = ()>) -> anyhow::Result<()> {
        let (tx, rx) = watch::channel(false);
        let handles = self.spawn_runners(rx);
        tracing::info!(stages = handles.len(), "Pipeline started");

        signal.await;
        tx.send(true).context("stage runners are gone")?;

        for result in join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Stage runner task failed");
            }
        }
        tracing::info!("Pipeline stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
