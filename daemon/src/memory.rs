//! Memory engine lifecycle for the daemon
//!
//! Opens the engine under a data directory and drives consolidation, either
//! once or on the background scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use context_memory::{
    ConsolidationScheduler, ConsolidationScope, EngineConfig, EngineStats, HashingEmbedding,
    MemoryEngine, MergeReport,
};

/// Owns the engine and, while running, its consolidation scheduler
pub struct MemoryManager {
    engine: Arc<MemoryEngine>,
    data_dir: PathBuf,
    scheduler: Option<ConsolidationScheduler>,
}

impl MemoryManager {
    /// Open the engine at `data_dir`, creating the directory if needed.
    ///
    /// `config_path` points to a JSON `EngineConfig`; defaults apply when
    /// absent.
    pub fn initialize(data_dir: &Path, config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => EngineConfig::from_json_file(path)
                .with_context(|| format!("failed to load config from {:?}", path))?,
            None => EngineConfig::default(),
        };

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {:?}", data_dir))?;

        let dimension = config.embedding_dimension;
        let engine = MemoryEngine::open(data_dir, config)
            .with_context(|| format!("failed to open memory store at {:?}", data_dir))?
            .with_embedder(Arc::new(HashingEmbedding::new(dimension)?))?;
        tracing::info!("[MemoryManager::initialize] memory store open at {:?}", data_dir);

        Ok(Self {
            engine: Arc::new(engine),
            data_dir: data_dir.to_path_buf(),
            scheduler: None,
        })
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// One consolidation pass over the whole graph
    pub async fn consolidate_once(&self) -> anyhow::Result<MergeReport> {
        let report = self
            .engine
            .run_consolidation(ConsolidationScope::All)
            .await
            .context("consolidation failed")?;
        if !report.failed_ids.is_empty() {
            tracing::warn!(
                "[MemoryManager] {} nodes need review after rolled-back merges",
                report.failed_ids.len()
            );
        }
        Ok(report)
    }

    /// Start periodic consolidation; the interval comes from `every` or the
    /// engine config
    pub fn start_scheduler(&mut self, every: Option<Duration>) {
        if self.scheduler.is_some() {
            return;
        }
        let every = every.unwrap_or_else(|| self.engine.config().consolidation.interval());
        self.scheduler = Some(ConsolidationScheduler::spawn(self.engine.clone(), every));
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// Stop the scheduler, waiting for an in-flight run
    pub async fn shutdown(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }
        tracing::info!(
            "[MemoryManager::shutdown] final stats: {}",
            serde_json::to_string(&self.engine.stats()).unwrap_or_default()
        );
    }
}
