//! Sync pipeline: configuration, per-jurisdiction runs, orchestration and scheduling.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sonar_crm::{CrmClient, SalesforceClient};
use sonar_portals::{portal_for, SessionFactory, WebDriverSessionFactory};
use sonar_storage::ArtifactStore;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub mod config;
pub mod events;
pub mod runner;
#[cfg(test)]
mod testing;

pub use config::{
    crm_config, load_jurisdictions, parse_registry, registry_path, CredentialStatus,
    JurisdictionEntry, JurisdictionSettings, SonarConfig, ValidationPolicy, DEFAULT_SYNC_CRON,
};
pub use events::{EventLog, EventSink, SyncEvent};
pub use runner::{JurisdictionRunner, RunStats, ScrapeError};

pub const CRATE_NAME: &str = "sonar-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success { stats: RunStats },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JurisdictionOutcome {
    pub jurisdiction: String,
    pub display_name: String,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_created: usize,
    pub outcomes: Vec<JurisdictionOutcome>,
    pub events: Vec<SyncEvent>,
}

impl RunSummary {
    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Failed { .. }))
            .count()
    }

    /// Plain-text daily summary, one line per jurisdiction.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let started = self.started_at.format("%Y-%m-%d %H:%M UTC");
        let _ = writeln!(out, "RFP Sonar run {} ({started})", self.run_id);
        let _ = writeln!(out, "{}", "=".repeat(60));
        for outcome in &self.outcomes {
            match &outcome.status {
                OutcomeStatus::Success { stats } => {
                    let _ = write!(
                        out,
                        "{}: SUCCESS ({} created, {} already in CRM",
                        outcome.display_name, stats.created, stats.duplicates
                    );
                    if stats.date_fallbacks > 0 {
                        let _ = write!(out, ", {} with fallback close date", stats.date_fallbacks);
                    }
                    if stats.rejected > 0 {
                        let _ = write!(out, ", {} rejected", stats.rejected);
                    }
                    let _ = writeln!(out, ")");
                }
                OutcomeStatus::Failed { error } => {
                    let _ = writeln!(out, "{}: FAILED: {error}", outcome.display_name);
                }
            }
        }
        let _ = writeln!(out, "{}", "=".repeat(60));
        let _ = writeln!(
            out,
            "Total created: {} | Jurisdictions failed: {}/{}",
            self.total_created,
            self.failed_count(),
            self.outcomes.len()
        );
        out
    }
}

/// Runs the registered jurisdictions one after another; one failure never stops the rest.
pub struct Orchestrator {
    crm: Arc<dyn CrmClient>,
    sessions: Arc<dyn SessionFactory>,
    artifacts: Option<ArtifactStore>,
    jurisdictions: Vec<JurisdictionSettings>,
    run_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        crm: Arc<dyn CrmClient>,
        sessions: Arc<dyn SessionFactory>,
        jurisdictions: Vec<JurisdictionSettings>,
    ) -> Self {
        Self {
            crm,
            sessions,
            artifacts: None,
            jurisdictions,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn from_config(config: &SonarConfig) -> Result<Self> {
        let crm = SalesforceClient::new(config.crm.clone()).context("building CRM client")?;
        let sessions = WebDriverSessionFactory::new(config.webdriver.clone());
        let orchestrator =
            Self::new(Arc::new(crm), Arc::new(sessions), config.jurisdictions.clone());
        Ok(match &config.artifacts_dir {
            Some(dir) => orchestrator.with_artifacts(ArtifactStore::new(dir.clone())),
            None => orchestrator,
        })
    }

    pub fn jurisdictions(&self) -> &[JurisdictionSettings] {
        &self.jurisdictions
    }

    /// Enabled jurisdictions in registry order, or exactly those named in `only`
    /// (disabled ones included when named).
    fn selected(&self, only: &[String]) -> Result<Vec<&JurisdictionSettings>> {
        if only.is_empty() {
            return Ok(self.jurisdictions.iter().filter(|j| j.entry.enabled).collect());
        }
        for id in only {
            if !self.jurisdictions.iter().any(|j| j.id() == id) {
                bail!("unknown jurisdiction `{id}`");
            }
        }
        Ok(self
            .jurisdictions
            .iter()
            .filter(|j| only.iter().any(|id| id == j.id()))
            .collect())
    }

    pub async fn run_all(&self, only: &[String]) -> Result<RunSummary> {
        let selected = self.selected(only)?;
        let _guard = self.run_lock.lock().await;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, jurisdictions = selected.len(), "sync run started");

        let events = EventLog::new();
        let runner = JurisdictionRunner::new(self.crm.as_ref(), self.sessions.as_ref(), &events)
            .with_artifacts(self.artifacts.as_ref());

        let mut outcomes = Vec::with_capacity(selected.len());
        let mut total_created = 0;
        for settings in selected {
            let portal = portal_for(settings.entry.portal, settings.profile());
            let status = match runner.run(portal.as_ref(), settings, started_at).await {
                Ok(stats) => {
                    total_created += stats.created;
                    OutcomeStatus::Success { stats }
                }
                Err(err) => OutcomeStatus::Failed {
                    error: err.to_string(),
                },
            };
            outcomes.push(JurisdictionOutcome {
                jurisdiction: settings.id().to_string(),
                display_name: settings.entry.display_name.clone(),
                status,
            });
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_created,
            outcomes,
            events: events.into_events(),
        };
        info!(
            %run_id,
            total_created = summary.total_created,
            failed = summary.failed_count(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// Run every enabled jurisdiction on `cron` until Ctrl-C.
    pub async fn schedule(self: Arc<Self>, cron: &str) -> Result<()> {
        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let orchestrator = Arc::clone(&self);
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                match orchestrator.run_all(&[]).await {
                    Ok(summary) => info!("\n{}", summary.render_text()),
                    Err(err) => error!(error = %err, "scheduled sync run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        info!(cron, "scheduler started; Ctrl-C to stop");

        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        info!("shutting down scheduler");
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}
