use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sonar_crm::{CrmAuth, CrmConfig, DEFAULT_API_VERSION, DEFAULT_LOGIN_URL, TOKEN_VALIDITY};
use sonar_portals::{PortalCredentials, PortalKind, PortalProfile, WebDriverConfig};
use tracing::info;

pub const DEFAULT_REGISTRY_PATH: &str = "./jurisdictions.yaml";
/// Six-field cron (seconds first): daily at 06:00.
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";

/// What to do when the CRM rejects one opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Fail the jurisdiction run.
    #[default]
    Abort,
    /// Record the rejection and continue with the next row.
    Skip,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JurisdictionRegistry {
    pub jurisdictions: Vec<JurisdictionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurisdictionEntry {
    pub id: String,
    pub display_name: String,
    pub account_code: String,
    pub portal: PortalKind,
    pub portal_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub username_env: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub on_validation_error: ValidationPolicy,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub enum CredentialStatus {
    NotRequired,
    Ready(PortalCredentials),
    /// Names of the settings that were absent.
    Missing(Vec<String>),
}

impl CredentialStatus {
    pub fn credentials(&self) -> Option<&PortalCredentials> {
        match self {
            CredentialStatus::Ready(creds) => Some(creds),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CredentialStatus::NotRequired => "no login".to_string(),
            CredentialStatus::Ready(_) => "credentials ready".to_string(),
            CredentialStatus::Missing(names) => format!("missing {}", names.join(", ")),
        }
    }
}

/// A registry entry with its portal credentials resolved.
#[derive(Debug, Clone)]
pub struct JurisdictionSettings {
    pub entry: JurisdictionEntry,
    pub credentials: CredentialStatus,
}

impl JurisdictionSettings {
    pub fn resolve(entry: JurisdictionEntry, lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let credentials = resolve_credentials(&entry, lookup);
        Self { entry, credentials }
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn profile(&self) -> PortalProfile {
        PortalProfile {
            id: self.entry.id.clone(),
            display_name: self.entry.display_name.clone(),
            entry_url: self.entry.portal_url.clone(),
        }
    }
}

fn resolve_credentials(
    entry: &JurisdictionEntry,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> CredentialStatus {
    if !entry.portal.requires_login() {
        return CredentialStatus::NotRequired;
    }
    let mut missing = Vec::new();
    let mut read = |var: &Option<String>, field: &str| match var {
        Some(name) => {
            let value = non_empty(lookup(name));
            if value.is_none() {
                missing.push(name.clone());
            }
            value
        }
        None => {
            missing.push(format!("{}.{field}", entry.id));
            None
        }
    };
    let username = read(&entry.username_env, "username_env");
    let password = read(&entry.password_env, "password_env");
    match (username, password) {
        (Some(username), Some(password)) => {
            CredentialStatus::Ready(PortalCredentials { username, password })
        }
        _ => CredentialStatus::Missing(missing),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn parse_registry(text: &str) -> Result<Vec<JurisdictionEntry>> {
    let registry: JurisdictionRegistry =
        serde_yaml::from_str(text).context("parsing jurisdiction registry")?;
    let mut seen = HashSet::new();
    for entry in &registry.jurisdictions {
        if entry.id.trim().is_empty() {
            bail!("jurisdiction with empty id");
        }
        if !seen.insert(entry.id.as_str()) {
            bail!("jurisdiction `{}` is listed twice", entry.id);
        }
        if entry.account_code.trim().is_empty() {
            bail!("jurisdiction `{}` has no account_code", entry.id);
        }
    }
    Ok(registry.jurisdictions)
}

pub fn load_jurisdictions(
    path: &Path,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<JurisdictionSettings>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let entries = parse_registry(&text).with_context(|| format!("in {}", path.display()))?;
    Ok(entries
        .into_iter()
        .map(|entry| JurisdictionSettings::resolve(entry, lookup))
        .collect())
}

pub fn registry_path(lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    non_empty(lookup("SONAR_REGISTRY"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_PATH))
}

pub fn crm_config(lookup: &dyn Fn(&str) -> Option<String>) -> Result<CrmConfig> {
    let var = |key: &str| non_empty(lookup(key));

    let instance_url = var("SF_INSTANCE_URL")
        .or_else(|| var("SALESFORCE_INSTANCE_URL"))
        .context("SF_INSTANCE_URL is not set")?;

    let auth = match (var("SF_CONSUMER_KEY"), var("SF_CONSUMER_SECRET"), var("SF_REFRESH_TOKEN")) {
        (Some(client_id), Some(client_secret), Some(refresh_token)) => CrmAuth::RefreshToken {
            login_url: var("SF_LOGIN_URL").unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
            client_id,
            client_secret,
            refresh_token,
        },
        _ => match var("SALESFORCE_API_KEY") {
            Some(token) => CrmAuth::StaticToken(token),
            None => bail!(
                "no CRM credentials: set SF_CONSUMER_KEY, SF_CONSUMER_SECRET and \
                 SF_REFRESH_TOKEN, or SALESFORCE_API_KEY"
            ),
        },
    };

    let timeout_secs = match var("SONAR_HTTP_TIMEOUT_SECS") {
        Some(v) => v.parse::<u64>().with_context(|| {
            format!("SONAR_HTTP_TIMEOUT_SECS must be a number of seconds, got `{v}`")
        })?,
        None => 30,
    };

    Ok(CrmConfig {
        instance_url,
        api_version: var("SF_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        auth,
        timeout: Duration::from_secs(timeout_secs),
        token_validity: TOKEN_VALIDITY,
    })
}

pub fn webdriver_config(lookup: &dyn Fn(&str) -> Option<String>) -> WebDriverConfig {
    let defaults = WebDriverConfig::default();
    WebDriverConfig {
        server_url: non_empty(lookup("SONAR_WEBDRIVER_URL")).unwrap_or(defaults.server_url),
        headless: non_empty(lookup("SONAR_HEADLESS"))
            .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False" | "no"))
            .unwrap_or(defaults.headless),
        download_dir: non_empty(lookup("SONAR_DOWNLOAD_DIR"))
            .map(PathBuf::from)
            .unwrap_or(defaults.download_dir),
    }
}

/// Everything a process needs, built once at startup and passed down.
#[derive(Debug, Clone)]
pub struct SonarConfig {
    pub crm: CrmConfig,
    pub webdriver: WebDriverConfig,
    pub registry_path: PathBuf,
    pub jurisdictions: Vec<JurisdictionSettings>,
    pub artifacts_dir: Option<PathBuf>,
    pub sync_cron: String,
}

impl SonarConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(&|key: &str| std::env::var(key).ok())?;
        config.log_summary();
        Ok(config)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let registry_path = registry_path(lookup);
        Ok(Self {
            crm: crm_config(lookup)?,
            webdriver: webdriver_config(lookup),
            jurisdictions: load_jurisdictions(&registry_path, lookup)?,
            registry_path,
            artifacts_dir: non_empty(lookup("SONAR_ARTIFACTS_DIR")).map(PathBuf::from),
            sync_cron: non_empty(lookup("SONAR_SYNC_CRON"))
                .unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }

    fn log_summary(&self) {
        let auth = match &self.crm.auth {
            CrmAuth::RefreshToken { client_id, .. } => {
                format!("refresh-token (client {})", preview(client_id))
            }
            CrmAuth::StaticToken(token) => format!("static token {}", preview(token)),
        };
        info!("Config loaded:");
        info!("  CRM: {} {} via {auth}", self.crm.instance_url, self.crm.api_version);
        info!("  WebDriver: {} (headless: {})", self.webdriver.server_url, self.webdriver.headless);
        info!("  Registry: {}", self.registry_path.display());
        for j in &self.jurisdictions {
            info!(
                "  {}: enabled={} {}",
                j.entry.id,
                j.entry.enabled,
                j.credentials.describe()
            );
        }
    }
}

fn preview(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    format!("{prefix}...({} chars)", value.chars().count())
}
