//! In-memory CRM and scripted portal sessions for exercising runs without a browser.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sonar_core::{AccountId, AccountStatusUpdate, OpportunityPayload};
use sonar_crm::{CrmClient, CrmError, CrmFieldError};
use sonar_portals::{
    DownloadedFile, Locator, PortalCredentials, PortalError, PortalKind, PortalSession,
    SessionFactory,
};

use crate::config::{CredentialStatus, JurisdictionEntry, JurisdictionSettings, ValidationPolicy};

pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

pub fn fixture(rel: &str) -> Vec<u8> {
    let path = workspace_root().join("fixtures").join(rel);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[derive(Default)]
pub struct FakeCrm {
    accounts: HashMap<String, String>,
    existing: HashMap<String, HashSet<String>>,
    rejecting: HashSet<String>,
    created: Mutex<Vec<OpportunityPayload>>,
    statuses: Mutex<Vec<(AccountId, AccountStatusUpdate)>>,
    calls: AtomicUsize,
}

impl FakeCrm {
    pub fn with_accounts(accounts: &[(&str, &str)]) -> Self {
        Self {
            accounts: accounts.iter().map(|(c, id)| (c.to_string(), id.to_string())).collect(),
            ..Default::default()
        }
    }

    pub fn with_existing(mut self, account: &str, numbers: &[&str]) -> Self {
        self.existing
            .entry(account.to_string())
            .or_default()
            .extend(numbers.iter().map(|n| n.to_string()));
        self
    }

    /// Create calls for this solicitation number fail with a validation error.
    pub fn rejecting(mut self, number: &str) -> Self {
        self.rejecting.insert(number.to_string());
        self
    }

    pub fn created(&self) -> Vec<OpportunityPayload> {
        self.created.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<(AccountId, AccountStatusUpdate)> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrmClient for FakeCrm {
    async fn find_account_id(&self, jurisdiction_code: &str) -> Result<AccountId, CrmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.accounts
            .get(jurisdiction_code)
            .map(AccountId::new)
            .ok_or_else(|| CrmError::NotFound(format!("no Account for {jurisdiction_code}")))
    }

    async fn fetch_existing_identifiers(
        &self,
        account_id: &AccountId,
    ) -> Result<HashSet<String>, CrmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut numbers = self.existing.get(account_id.as_str()).cloned().unwrap_or_default();
        numbers.extend(
            self.created
                .lock()
                .unwrap()
                .iter()
                .filter(|p| &p.account_id == account_id)
                .map(|p| p.solicitation_number.clone()),
        );
        Ok(numbers)
    }

    async fn create_opportunity(&self, payload: &OpportunityPayload) -> Result<String, CrmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.contains(&payload.solicitation_number) {
            return Err(CrmError::Validation {
                status: 400,
                errors: vec![CrmFieldError {
                    message: "Close Date must be in the future".into(),
                    error_code: "FIELD_CUSTOM_VALIDATION_EXCEPTION".into(),
                    fields: vec!["CloseDate".into()],
                }],
            });
        }
        let mut created = self.created.lock().unwrap();
        created.push(payload.clone());
        Ok(format!("006{:05}", created.len()))
    }

    async fn update_account_status(
        &self,
        account_id: &AccountId,
        update: &AccountStatusUpdate,
    ) -> Result<(), CrmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.statuses.lock().unwrap().push((account_id.clone(), update.clone()));
        Ok(())
    }
}

/// What a scripted portal shows. Every locator is present unless listed in `missing`.
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    pub page: String,
    pub url: String,
    pub missing: HashSet<Locator>,
    pub download: Option<DownloadedFile>,
}

pub fn kentucky_script() -> SessionScript {
    SessionScript {
        page: String::from_utf8(fixture("kentucky/results.html")).unwrap(),
        url: "https://vss.ky.gov/vssprod-ext/Advantage4".into(),
        ..Default::default()
    }
}

pub fn pennsylvania_script() -> SessionScript {
    SessionScript {
        url: "https://www.emarketplace.state.pa.us/Search.aspx".into(),
        download: Some(DownloadedFile {
            file_name: "SearchResults.csv".into(),
            bytes: fixture("pennsylvania/export.csv"),
        }),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeSessions {
    scripts: HashMap<String, SessionScript>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl FakeSessions {
    pub fn kentucky() -> Self {
        Self::default().script("kentucky", kentucky_script())
    }

    pub fn script(mut self, id: &str, script: SessionScript) -> Self {
        self.scripts.insert(id.to_string(), script);
        self
    }

    /// Hide `locator` in every scripted portal.
    pub fn missing(mut self, locator: Locator) -> Self {
        for script in self.scripts.values_mut() {
            script.missing.insert(locator.clone());
        }
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FakeSessions {
    async fn open(&self, jurisdiction_id: &str) -> Result<Box<dyn PortalSession>, PortalError> {
        let script = self
            .scripts
            .get(jurisdiction_id)
            .cloned()
            .ok_or_else(|| {
                PortalError::Driver(format!("no scripted portal for {jurisdiction_id}"))
            })?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            script,
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct FakeSession {
    script: SessionScript,
    closed: Arc<AtomicUsize>,
}

impl FakeSession {
    fn check(&self, target: &Locator) -> Result<(), PortalError> {
        if self.script.missing.contains(target) {
            Err(PortalError::Navigation(target.to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PortalSession for FakeSession {
    async fn goto(&mut self, _url: &str) -> Result<(), PortalError> {
        Ok(())
    }

    async fn fill(&mut self, target: &Locator, _value: &str) -> Result<(), PortalError> {
        self.check(target)
    }

    async fn click(&mut self, target: &Locator) -> Result<(), PortalError> {
        self.check(target)
    }

    async fn select_option(&mut self, target: &Locator, _label: &str) -> Result<(), PortalError> {
        self.check(target)
    }

    async fn is_present(&mut self, target: &Locator) -> Result<bool, PortalError> {
        Ok(!self.script.missing.contains(target))
    }

    async fn wait_for(&mut self, target: &Locator, timeout: Duration) -> Result<(), PortalError> {
        self.check(target).map_err(|_| PortalError::Timeout {
            what: target.to_string(),
            waited: timeout,
        })
    }

    async fn settle(&mut self, _grace: Duration) -> Result<(), PortalError> {
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String, PortalError> {
        Ok(self.script.page.clone())
    }

    async fn current_url(&mut self) -> Result<String, PortalError> {
        Ok(self.script.url.clone())
    }

    async fn download(
        &mut self,
        trigger: &Locator,
        timeout: Duration,
    ) -> Result<DownloadedFile, PortalError> {
        self.check(trigger)?;
        self.script.download.take().ok_or(PortalError::Timeout {
            what: trigger.to_string(),
            waited: timeout,
        })
    }

    async fn close(&mut self) -> Result<(), PortalError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn kentucky_settings() -> JurisdictionSettings {
    JurisdictionSettings {
        entry: JurisdictionEntry {
            id: "kentucky".into(),
            display_name: "Commonwealth of Kentucky".into(),
            account_code: "KY".into(),
            portal: PortalKind::KentuckyVss,
            portal_url: "https://vss.ky.gov/".into(),
            enabled: true,
            username_env: Some("KY_VSS_USERNAME".into()),
            password_env: Some("KY_VSS_PASSWORD".into()),
            on_validation_error: ValidationPolicy::Abort,
        },
        credentials: CredentialStatus::Ready(PortalCredentials {
            username: "vendor01".into(),
            password: "hunter2".into(),
        }),
    }
}

pub fn pennsylvania_settings() -> JurisdictionSettings {
    JurisdictionSettings {
        entry: JurisdictionEntry {
            id: "pennsylvania".into(),
            display_name: "Commonwealth of Pennsylvania".into(),
            account_code: "PA".into(),
            portal: PortalKind::PennsylvaniaEmarketplace,
            portal_url: "https://www.emarketplace.state.pa.us/Search.aspx".into(),
            enabled: true,
            username_env: None,
            password_env: None,
            on_validation_error: ValidationPolicy::Skip,
        },
        credentials: CredentialStatus::NotRequired,
    }
}
