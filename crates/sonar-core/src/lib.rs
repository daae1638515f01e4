//! Core domain model for RFP Sonar: scraped solicitations and the CRM records they map onto.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "sonar-core";

/// CRM `Name` field length limit. Longer titles are truncated, never rejected.
pub const NAME_MAX_CHARS: usize = 120;
/// Limit for free-text lookup-ish fields (department, buyer) and status error detail.
pub const TEXT_FIELD_MAX_CHARS: usize = 255;

pub const STAGE_PROSPECTING: &str = "Prospecting";
pub const DATA_SOURCE_SCRAPER: &str = "Automated Scraper";
pub const RESPONSE_STATUS_NEW: &str = "New - Not Reviewed";

/// Salesforce Account identifier for one jurisdiction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One solicitation row scraped from a portal. Ephemeral: built per scrape pass and
/// discarded once mapped onto an [`OpportunityPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolicitationRecord {
    pub title: String,
    /// Jurisdiction-issued identifier; the dedup key.
    pub solicitation_number: String,
    /// `None` when the portal text could not be parsed.
    pub closing_date: Option<NaiveDate>,
    pub closing_date_raw: String,
    pub description: String,
    pub detail_url: Option<String>,
    pub department: Option<String>,
    pub buyer_name: Option<String>,
    pub solicitation_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowParseError {
    #[error("row is missing {0}")]
    MissingField(&'static str),
    #[error("malformed row: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateParseError {
    #[error("closing date is empty")]
    Empty,
    #[error("unrecognized closing date format: {0:?}")]
    Unrecognized(String),
}

// Tried against the whole text.
const NAMED_MONTH_FORMATS: &[&str] = &["%B %d, %Y", "%b %d, %Y"];
// Tried against the first whitespace token, so time and zone suffixes
// ("10/14/2025 03:30 PM EDT", "12/30/2025 02:00:00 PM") drop out.
const NUMERIC_FORMATS: &[&str] = &["%m/%d/%Y", "%m-%d-%Y", "%Y-%m-%d", "%m/%d/%y"];

/// Parse portal closing-date text into a calendar date.
pub fn parse_closing_date(text: &str) -> Result<NaiveDate, DateParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DateParseError::Empty);
    }

    for fmt in NAMED_MONTH_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Ok(date);
        }
    }

    let first_token = trimmed.split_whitespace().next().unwrap_or(trimmed);
    for fmt in NUMERIC_FORMATS {
        // chrono's %Y happily reads "25" as year 25
        if let Ok(date) = NaiveDate::parse_from_str(first_token, fmt) {
            if date.year() >= 1900 {
                return Ok(date);
            }
        }
    }

    Err(DateParseError::Unrecognized(trimmed.to_string()))
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((byte_idx, _)) => value[..byte_idx].to_string(),
        None => value.to_string(),
    }
}

pub fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

const SOLICITATION_TYPES: &[(&str, &str)] = &[
    ("rfp", "RFP - Request for Proposal"),
    ("rfb", "RFB - Request for Bids"),
    ("rfq", "RFQ - Request for Quote"),
    ("rfi", "RFI - Request for Information"),
    ("ifb", "IFB - Invitation for Bid"),
    ("rft", "RFT - Request for Tender"),
];

/// Map portal type text onto the CRM `Solicitation_Type__c` picklist.
pub fn map_solicitation_type(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return "Other";
    };
    let lower = raw.to_ascii_lowercase();
    SOLICITATION_TYPES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, value)| *value)
        .unwrap_or("Other")
}

const CATEGORIES: &[(&str, &str)] = &[
    ("legal", "Legal Services"),
    ("construction", "Construction"),
    ("equipment", "Equipment"),
    ("technology", "Technology/IT Services"),
    ("it services", "Technology/IT Services"),
    ("professional", "Professional Services"),
    ("consulting", "Consulting"),
    ("supplies", "Supplies"),
    ("maintenance", "Maintenance/Repair"),
    ("healthcare", "Healthcare"),
    ("medical", "Healthcare"),
];

/// Map free text onto the `RFP_Category__c` picklist. First keyword in table order wins.
pub fn map_category(raw: &str) -> &'static str {
    let lower = raw.to_lowercase();
    CATEGORIES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, value)| *value)
        .unwrap_or("Other")
}

/// Resolve a detail href against the page it was found on. Fragment-only and
/// `javascript:` links resolve to nothing.
pub fn resolve_link(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    if let Ok(absolute) = Url::parse(href) {
        return Some(absolute.to_string());
    }
    Url::parse(base)
        .and_then(|base| base.join(href))
        .ok()
        .map(|u| u.to_string())
}

/// Opportunity create body. Field names are the CRM's and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityPayload {
    #[serde(rename = "AccountId")]
    pub account_id: AccountId,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Solicitation_Number__c")]
    pub solicitation_number: String,
    #[serde(rename = "CloseDate")]
    pub close_date: NaiveDate,
    #[serde(rename = "StageName")]
    pub stage_name: String,
    #[serde(rename = "Solicitation_Type__c")]
    pub solicitation_type: String,
    #[serde(rename = "RFP_Category__c")]
    pub category: String,
    #[serde(rename = "Department__c", skip_serializing_if = "Option::is_none", default)]
    pub department: Option<String>,
    #[serde(rename = "Buyer_Name__c", skip_serializing_if = "Option::is_none", default)]
    pub buyer_name: Option<String>,
    #[serde(rename = "Portal_URL__c")]
    pub portal_url: String,
    #[serde(rename = "Data_Source__c")]
    pub data_source: String,
    #[serde(rename = "Response_Status__c")]
    pub response_status: String,
    #[serde(rename = "Description")]
    pub description: String,
}

impl OpportunityPayload {
    /// Map a scraped record onto a create body. An unparsed closing date falls back to
    /// `run_date`; callers detect that case via `record.closing_date.is_none()`.
    pub fn from_record(
        record: &SolicitationRecord,
        account_id: &AccountId,
        entry_url: &str,
        run_date: NaiveDate,
    ) -> Self {
        let name = if record.title.trim().is_empty() {
            record.solicitation_number.clone()
        } else {
            record.title.clone()
        };
        let portal_url = record
            .detail_url
            .clone()
            .unwrap_or_else(|| entry_url.to_string());

        let mut description = String::new();
        if !record.description.trim().is_empty() {
            description.push_str(record.description.trim());
            description.push_str("\n\n");
        }
        description.push_str(&format!(
            "Solicitation Number: {}\nClosing Date: {}\nLink: {}",
            record.solicitation_number, record.closing_date_raw, portal_url
        ));

        Self {
            account_id: account_id.clone(),
            name: truncate_chars(name.trim(), NAME_MAX_CHARS),
            solicitation_number: record.solicitation_number.clone(),
            close_date: record.closing_date.unwrap_or(run_date),
            stage_name: STAGE_PROSPECTING.to_string(),
            solicitation_type: map_solicitation_type(record.solicitation_type.as_deref())
                .to_string(),
            category: map_category(&format!("{} {}", record.title, record.description))
                .to_string(),
            department: record
                .department
                .as_deref()
                .map(|d| truncate_chars(d, TEXT_FIELD_MAX_CHARS)),
            buyer_name: record
                .buyer_name
                .as_deref()
                .map(|b| truncate_chars(b, TEXT_FIELD_MAX_CHARS)),
            portal_url,
            data_source: DATA_SOURCE_SCRAPER.to_string(),
            response_status: RESPONSE_STATUS_NEW.to_string(),
            description,
        }
    }
}

/// Account scrape status picklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScrapeStatus {
    #[serde(rename = "Not Configured")]
    NotConfigured,
    Running,
    Success,
    Failed,
}

impl ScrapeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrapeStatus::NotConfigured => "Not Configured",
            ScrapeStatus::Running => "Running",
            ScrapeStatus::Success => "Success",
            ScrapeStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account PATCH body written once at the end of every jurisdiction run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatusUpdate {
    #[serde(rename = "Scrape_Status__c")]
    pub status: ScrapeStatus,
    #[serde(rename = "Last_Scrape_Date__c")]
    pub scraped_at: DateTime<Utc>,
    /// Serialized as null on success so a previous failure message is cleared.
    #[serde(rename = "Scrape_Error__c")]
    pub error_detail: Option<String>,
}

impl AccountStatusUpdate {
    pub fn success(scraped_at: DateTime<Utc>) -> Self {
        Self {
            status: ScrapeStatus::Success,
            scraped_at,
            error_detail: None,
        }
    }

    pub fn failed(scraped_at: DateTime<Utc>, detail: &str) -> Self {
        Self {
            status: ScrapeStatus::Failed,
            scraped_at,
            error_detail: Some(truncate_chars(detail, TEXT_FIELD_MAX_CHARS)),
        }
    }
}
