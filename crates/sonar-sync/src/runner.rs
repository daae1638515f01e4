use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sonar_core::{AccountId, AccountStatusUpdate, OpportunityPayload};
use sonar_crm::{CrmClient, CrmError};
use sonar_portals::{
    Jurisdiction, PortalError, PortalSession, RawCapture, RowExtract, SessionFactory,
};
use sonar_storage::{ArtifactStore, CaptureKind};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

use crate::config::{CredentialStatus, JurisdictionSettings, ValidationPolicy};
use crate::events::{EventSink, SyncEvent};

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Crm(#[from] CrmError),
    #[error(transparent)]
    Portal(#[from] PortalError),
}

/// Per-jurisdiction counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub extracted: usize,
    pub created: usize,
    pub duplicates: usize,
    pub short_rows: usize,
    pub invalid_rows: usize,
    pub date_fallbacks: usize,
    pub rejected: usize,
}

/// Runs one jurisdiction end to end: config check, account lookup, dedup set, portal
/// session, row sync, then exactly one account status report.
pub struct JurisdictionRunner<'a> {
    crm: &'a dyn CrmClient,
    sessions: &'a dyn SessionFactory,
    artifacts: Option<&'a ArtifactStore>,
    events: &'a dyn EventSink,
}

impl<'a> JurisdictionRunner<'a> {
    pub fn new(
        crm: &'a dyn CrmClient,
        sessions: &'a dyn SessionFactory,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            crm,
            sessions,
            artifacts: None,
            events,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Option<&'a ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// `run_started` is also the fallback closing date for rows whose date did not parse.
    pub async fn run(
        &self,
        jurisdiction: &dyn Jurisdiction,
        settings: &JurisdictionSettings,
        run_started: DateTime<Utc>,
    ) -> Result<RunStats, ScrapeError> {
        let span = info_span!("jurisdiction", id = %settings.id());
        self.run_inner(jurisdiction, settings, run_started).instrument(span).await
    }

    async fn run_inner(
        &self,
        jurisdiction: &dyn Jurisdiction,
        settings: &JurisdictionSettings,
        run_started: DateTime<Utc>,
    ) -> Result<RunStats, ScrapeError> {
        let id = settings.id().to_string();
        self.events.emit(SyncEvent::RunStarted {
            jurisdiction: id.clone(),
            at: run_started,
        });

        if let CredentialStatus::Missing(names) = &settings.credentials {
            if jurisdiction.requires_login() {
                let err = ScrapeError::Configuration(format!(
                    "{} portal credentials not set: {}",
                    settings.entry.display_name,
                    names.join(", ")
                ));
                return Err(self.failed(&id, err));
            }
        }

        let account = match self.crm.find_account_id(&settings.entry.account_code).await {
            Ok(account) => account,
            Err(err) => return Err(self.failed(&id, err.into())),
        };
        self.events.emit(SyncEvent::AccountResolved {
            jurisdiction: id.clone(),
            account_id: account.to_string(),
        });

        let outcome = self.sync(jurisdiction, settings, &account, run_started).await;
        self.report(&id, &account, outcome).await
    }

    async fn sync(
        &self,
        jurisdiction: &dyn Jurisdiction,
        settings: &JurisdictionSettings,
        account: &AccountId,
        run_started: DateTime<Utc>,
    ) -> Result<RunStats, ScrapeError> {
        let existing = self.crm.fetch_existing_identifiers(account).await?;
        self.events.emit(SyncEvent::ExistingLoaded {
            jurisdiction: settings.id().to_string(),
            count: existing.len(),
        });

        let mut session = self.sessions.open(settings.id()).await?;
        let outcome = self
            .drive(session.as_mut(), jurisdiction, settings, account, existing, run_started)
            .await;

        if outcome.is_err() {
            self.snapshot_failure(session.as_mut(), settings.id(), run_started).await;
        }
        if let Err(err) = session.close().await {
            warn!(error = %err, "closing browser session failed");
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut dyn PortalSession,
        jurisdiction: &dyn Jurisdiction,
        settings: &JurisdictionSettings,
        account: &AccountId,
        existing: HashSet<String>,
        run_started: DateTime<Utc>,
    ) -> Result<RunStats, ScrapeError> {
        let id = settings.id();
        session.goto(jurisdiction.entry_url()).await?;
        if jurisdiction.requires_login() {
            jurisdiction.login(session, settings.credentials.credentials()).await?;
        }
        jurisdiction.navigate(session).await?;
        let extraction = jurisdiction.extract(session).await?;

        if let Some(capture) = &extraction.capture {
            self.store_capture(id, run_started, CaptureKind::Export, capture).await;
        }

        let run_date = run_started.date_naive();
        let mut known = existing;
        let mut stats = RunStats::default();

        for row in extraction.rows {
            let record = match row {
                RowExtract::Record(record) => record,
                RowExtract::Short { row, cells, expected } => {
                    stats.short_rows += 1;
                    self.events.emit(SyncEvent::RowSkippedShort {
                        jurisdiction: id.to_string(),
                        row,
                        cells,
                        expected,
                    });
                    continue;
                }
                RowExtract::Invalid { row, error } => {
                    stats.invalid_rows += 1;
                    self.events.emit(SyncEvent::RowInvalid {
                        jurisdiction: id.to_string(),
                        row,
                        reason: error.to_string(),
                    });
                    continue;
                }
            };
            stats.extracted += 1;

            let number = record.solicitation_number.trim().to_string();
            if known.contains(&number) {
                stats.duplicates += 1;
                self.events.emit(SyncEvent::DuplicateSkipped {
                    jurisdiction: id.to_string(),
                    solicitation_number: number,
                });
                continue;
            }

            let payload = OpportunityPayload::from_record(
                &record,
                account,
                jurisdiction.entry_url(),
                run_date,
            );
            match self.crm.create_opportunity(&payload).await {
                Ok(opportunity_id) => {
                    stats.created += 1;
                    self.events.emit(SyncEvent::OpportunityCreated {
                        jurisdiction: id.to_string(),
                        solicitation_number: number.clone(),
                        opportunity_id,
                    });
                    if record.closing_date.is_none() {
                        stats.date_fallbacks += 1;
                        self.events.emit(SyncEvent::CloseDateFallback {
                            jurisdiction: id.to_string(),
                            solicitation_number: number.clone(),
                            raw: record.closing_date_raw.clone(),
                            fallback: run_date,
                        });
                    }
                    known.insert(number);
                }
                Err(err @ CrmError::Validation { .. })
                    if settings.entry.on_validation_error == ValidationPolicy::Skip =>
                {
                    stats.rejected += 1;
                    self.events.emit(SyncEvent::OpportunityRejected {
                        jurisdiction: id.to_string(),
                        solicitation_number: number,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(stats)
    }

    /// The single account status write for a run whose account was resolved.
    async fn report(
        &self,
        id: &str,
        account: &AccountId,
        outcome: Result<RunStats, ScrapeError>,
    ) -> Result<RunStats, ScrapeError> {
        match outcome {
            Ok(stats) => {
                if let Err(err) = self
                    .crm
                    .update_account_status(account, &AccountStatusUpdate::success(Utc::now()))
                    .await
                {
                    self.events.emit(SyncEvent::StatusReportFailed {
                        jurisdiction: id.to_string(),
                        error: err.to_string(),
                    });
                    return Err(self.failed(id, err.into()));
                }
                self.events.emit(SyncEvent::RunSucceeded {
                    jurisdiction: id.to_string(),
                    created: stats.created,
                });
                Ok(stats)
            }
            Err(err) => {
                let update = AccountStatusUpdate::failed(Utc::now(), &err.to_string());
                if let Err(status_err) = self.crm.update_account_status(account, &update).await {
                    self.events.emit(SyncEvent::StatusReportFailed {
                        jurisdiction: id.to_string(),
                        error: status_err.to_string(),
                    });
                }
                Err(self.failed(id, err))
            }
        }
    }

    fn failed(&self, id: &str, err: ScrapeError) -> ScrapeError {
        self.events.emit(SyncEvent::RunFailed {
            jurisdiction: id.to_string(),
            error: err.to_string(),
        });
        err
    }

    async fn store_capture(
        &self,
        id: &str,
        at: DateTime<Utc>,
        kind: CaptureKind,
        capture: &RawCapture,
    ) {
        let Some(store) = self.artifacts else {
            return;
        };
        match store.store(at, id, kind, capture.extension, &capture.bytes).await {
            Ok(stored) => self.events.emit(SyncEvent::CaptureStored {
                jurisdiction: id.to_string(),
                path: stored.relative_path.display().to_string(),
            }),
            Err(err) => warn!(error = %err, "storing capture failed"),
        }
    }

    async fn snapshot_failure(&self, session: &mut dyn PortalSession, id: &str, at: DateTime<Utc>) {
        if self.artifacts.is_none() {
            return;
        }
        match session.page_source().await {
            Ok(html) => {
                let capture = RawCapture {
                    extension: "html",
                    bytes: html.into_bytes(),
                };
                self.store_capture(id, at, CaptureKind::FailureSnapshot, &capture).await;
            }
            Err(err) => warn!(error = %err, "no page source for failure snapshot"),
        }
    }
}
