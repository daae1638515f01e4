use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// One observable step of a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    RunStarted {
        jurisdiction: String,
        at: DateTime<Utc>,
    },
    AccountResolved {
        jurisdiction: String,
        account_id: String,
    },
    ExistingLoaded {
        jurisdiction: String,
        count: usize,
    },
    RowSkippedShort {
        jurisdiction: String,
        row: usize,
        cells: usize,
        expected: usize,
    },
    RowInvalid {
        jurisdiction: String,
        row: usize,
        reason: String,
    },
    DuplicateSkipped {
        jurisdiction: String,
        solicitation_number: String,
    },
    OpportunityCreated {
        jurisdiction: String,
        solicitation_number: String,
        opportunity_id: String,
    },
    /// Created with the run date because the portal's closing date did not parse.
    CloseDateFallback {
        jurisdiction: String,
        solicitation_number: String,
        raw: String,
        fallback: NaiveDate,
    },
    OpportunityRejected {
        jurisdiction: String,
        solicitation_number: String,
        reason: String,
    },
    CaptureStored {
        jurisdiction: String,
        path: String,
    },
    StatusReportFailed {
        jurisdiction: String,
        error: String,
    },
    RunSucceeded {
        jurisdiction: String,
        created: usize,
    },
    RunFailed {
        jurisdiction: String,
        error: String,
    },
}

impl SyncEvent {
    pub fn jurisdiction(&self) -> &str {
        match self {
            SyncEvent::RunStarted { jurisdiction, .. }
            | SyncEvent::AccountResolved { jurisdiction, .. }
            | SyncEvent::ExistingLoaded { jurisdiction, .. }
            | SyncEvent::RowSkippedShort { jurisdiction, .. }
            | SyncEvent::RowInvalid { jurisdiction, .. }
            | SyncEvent::DuplicateSkipped { jurisdiction, .. }
            | SyncEvent::OpportunityCreated { jurisdiction, .. }
            | SyncEvent::CloseDateFallback { jurisdiction, .. }
            | SyncEvent::OpportunityRejected { jurisdiction, .. }
            | SyncEvent::CaptureStored { jurisdiction, .. }
            | SyncEvent::StatusReportFailed { jurisdiction, .. }
            | SyncEvent::RunSucceeded { jurisdiction, .. }
            | SyncEvent::RunFailed { jurisdiction, .. } => jurisdiction,
        }
    }

    fn trace(&self) {
        match self {
            SyncEvent::RunStarted { jurisdiction, .. } => info!(jurisdiction, "run started"),
            SyncEvent::AccountResolved {
                jurisdiction,
                account_id,
            } => info!(jurisdiction, account_id, "account resolved"),
            SyncEvent::ExistingLoaded { jurisdiction, count } => {
                info!(jurisdiction, count, "existing solicitations loaded")
            }
            SyncEvent::RowSkippedShort {
                jurisdiction,
                row,
                cells,
                ..
            } => info!(jurisdiction, row, cells, "short row skipped"),
            SyncEvent::RowInvalid {
                jurisdiction,
                row,
                reason,
            } => warn!(jurisdiction, row, reason, "row not parsed"),
            SyncEvent::DuplicateSkipped {
                jurisdiction,
                solicitation_number,
            } => info!(jurisdiction, solicitation_number, "already in CRM"),
            SyncEvent::OpportunityCreated {
                jurisdiction,
                solicitation_number,
                opportunity_id,
            } => info!(jurisdiction, solicitation_number, opportunity_id, "opportunity created"),
            SyncEvent::CloseDateFallback {
                jurisdiction,
                solicitation_number,
                raw,
                fallback,
            } => warn!(
                jurisdiction,
                solicitation_number,
                raw,
                %fallback,
                "closing date unparsed; used run date"
            ),
            SyncEvent::OpportunityRejected {
                jurisdiction,
                solicitation_number,
                reason,
            } => warn!(jurisdiction, solicitation_number, reason, "opportunity rejected"),
            SyncEvent::CaptureStored { jurisdiction, path } => {
                info!(jurisdiction, path, "capture stored")
            }
            SyncEvent::StatusReportFailed { jurisdiction, error } => {
                warn!(jurisdiction, error, "account status update failed")
            }
            SyncEvent::RunSucceeded { jurisdiction, created } => {
                info!(jurisdiction, created, "run succeeded")
            }
            SyncEvent::RunFailed { jurisdiction, error } => {
                warn!(jurisdiction, error, "run failed")
            }
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Keeps every event in memory and mirrors it to tracing.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<SyncEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn into_events(self) -> Vec<SyncEvent> {
        self.events.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: SyncEvent) {
        event.trace();
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = SyncEvent::DuplicateSkipped {
            jurisdiction: "kentucky".into(),
            solicitation_number: "RFB-1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "duplicate_skipped");
        assert_eq!(value["solicitation_number"], "RFB-1");
        assert_eq!(event.jurisdiction(), "kentucky");
    }

    #[test]
    fn log_keeps_emission_order() {
        let log = EventLog::new();
        log.emit(SyncEvent::RunSucceeded {
            jurisdiction: "a".into(),
            created: 1,
        });
        log.emit(SyncEvent::RunFailed {
            jurisdiction: "b".into(),
            error: "boom".into(),
        });
        let events = log.into_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].jurisdiction(), "b");
    }
}
