//! Store and provider wiring.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use draftmill_core::JobId;
use draftmill_infra::{PostgresJobStore, ProviderSettings, Settings};
use draftmill_pipeline::fixtures::demo_provider;
use draftmill_pipeline::{
    ContinueOutcome, GenerationBrief, InMemoryJobStore, JobRecord, JobStatusView, Orchestrator,
    OrchestratorError, PipelineConfig, ResetMode, StoreError,
};
use draftmill_providers::{
    HttpProvider, HttpProviderConfig, ProviderHealthSnapshot, ProviderPool, ProviderTier,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("record store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// The orchestrator over whichever store the process was configured with.
pub enum AppServices {
    InMemory(Orchestrator<InMemoryJobStore>),
    Persistent(Orchestrator<PostgresJobStore>),
}

macro_rules! with_orchestrator {
    ($services:expr, $orch:ident => $body:expr) => {
        match $services {
            AppServices::InMemory($orch) => $body,
            AppServices::Persistent($orch) => $body,
        }
    };
}

impl AppServices {
    /// In-memory services over an explicit provider pool (tests, local runs).
    pub fn in_memory(pool: ProviderPool, config: PipelineConfig) -> Result<Self, ServiceError> {
        let orch = Orchestrator::new(InMemoryJobStore::arc(), pool, config)?;
        Ok(AppServices::InMemory(orch))
    }

    pub fn store_kind(&self) -> &'static str {
        match self {
            AppServices::InMemory(_) => "in_memory",
            AppServices::Persistent(_) => "postgres",
        }
    }

    pub async fn create_job(&self, brief: GenerationBrief) -> Result<JobId, OrchestratorError> {
        with_orchestrator!(self, o => o.create_job(brief).await)
    }

    pub async fn continue_job(&self, job_id: JobId) -> Result<ContinueOutcome, OrchestratorError> {
        with_orchestrator!(self, o => o.continue_job(job_id).await)
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatusView, OrchestratorError> {
        with_orchestrator!(self, o => o.status(job_id).await)
    }

    pub async fn job(&self, job_id: JobId) -> Result<JobRecord, OrchestratorError> {
        with_orchestrator!(self, o => o.job(job_id).await)
    }

    pub async fn reset_job(
        &self,
        job_id: JobId,
        mode: ResetMode,
    ) -> Result<JobStatusView, OrchestratorError> {
        with_orchestrator!(self, o => o.reset_job(job_id, mode).await)
    }

    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<JobStatusView>, OrchestratorError> {
        with_orchestrator!(self, o => o.list_jobs(limit).await)
    }

    pub async fn stale_jobs(&self, limit: usize) -> Result<Vec<JobStatusView>, OrchestratorError> {
        with_orchestrator!(self, o => o.stale_jobs(limit).await)
    }

    pub fn provider_health(&self) -> Vec<ProviderHealthSnapshot> {
        with_orchestrator!(self, o => o.breaker().snapshot_at(Utc::now()))
    }
}

/// Wire the store and providers described by `settings`.
pub async fn build_services(settings: &Settings) -> Result<AppServices, ServiceError> {
    let pool = provider_pool(settings.provider.as_ref());
    let config = settings.pipeline.clone();

    match &settings.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url).await?;
            store.ensure_schema().await?;
            info!("using postgres job store");
            let orch = Orchestrator::new(Arc::new(store), pool, config)?;
            Ok(AppServices::Persistent(orch))
        }
        None => {
            info!("using in-memory job store; jobs are lost on restart");
            AppServices::in_memory(pool, config)
        }
    }
}

fn provider_pool(provider: Option<&ProviderSettings>) -> ProviderPool {
    let Some(provider) = provider else {
        info!("no provider configured; serving the deterministic demo provider");
        return ProviderPool::new()
            .with_provider(ProviderTier::Quality, Arc::new(demo_provider("demo-quality")))
            .with_provider(ProviderTier::Fast, Arc::new(demo_provider("demo-fast")));
    };

    let http = |tier: ProviderTier, model: &str| {
        Arc::new(HttpProvider::new(HttpProviderConfig {
            name: format!("{}:{model}", tier.as_str()),
            base_url: provider.base_url.clone(),
            api_key: provider.api_key.clone(),
            model: model.to_string(),
        }))
    };

    ProviderPool::new()
        .with_provider(
            ProviderTier::Quality,
            http(ProviderTier::Quality, &provider.quality_model),
        )
        .with_provider(ProviderTier::Fast, http(ProviderTier::Fast, &provider.fast_model))
}
