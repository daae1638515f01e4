//! Portal driver contracts, the WebDriver-backed session, and per-jurisdiction portal flows.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{
    parse_closing_date, resolve_link, text_or_none, RowParseError, SolicitationRecord,
};
use thirtyfour::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "sonar-portals";

/// Default bound for an interactive element to appear.
pub const ELEMENT_WAIT: Duration = Duration::from_secs(15);
/// Bound for a results table or export trigger after a search.
pub const RESULTS_WAIT: Duration = Duration::from_secs(30);
pub const DOWNLOAD_WAIT: Duration = Duration::from_secs(60);
pub const SETTLE_GRACE: Duration = Duration::from_secs(2);
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal login failed: {0}")]
    Authentication(String),
    #[error("element not found: {0}")]
    Navigation(String),
    #[error("timed out after {}s waiting for {what}", .waited.as_secs())]
    Timeout { what: String, waited: Duration },
    #[error("browser driver error: {0}")]
    Driver(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("unreadable portal export: {0}")]
    Export(String),
}

fn driver_error(err: WebDriverError) -> PortalError {
    PortalError::Driver(err.to_string())
}

/// How a portal element is found. Text-based variants match on whitespace-normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Css(String),
    Button(String),
    Link(String),
    /// Form control associated with a `<label>`.
    Labeled(String),
    /// Any element whose own text matches.
    Text(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn button(text: impl Into<String>) -> Self {
        Locator::Button(text.into())
    }

    pub fn link(text: impl Into<String>) -> Self {
        Locator::Link(text.into())
    }

    pub fn labeled(text: impl Into<String>) -> Self {
        Locator::Labeled(text.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Locator::Text(text.into())
    }

    fn to_by(&self) -> By {
        match self {
            Locator::Css(selector) => By::Css(selector.as_str()),
            Locator::Button(text) => {
                let lit = xpath_literal(text);
                By::XPath(format!(
                    "//button[normalize-space()={lit}] \
                     | //input[(@type='submit' or @type='button') \
                       and normalize-space(@value)={lit}] \
                     | //*[@role='button' and normalize-space()={lit}]"
                ))
            }
            Locator::Link(text) => {
                By::XPath(format!("//a[normalize-space()={}]", xpath_literal(text)))
            }
            Locator::Labeled(text) => {
                let lit = xpath_literal(text);
                By::XPath(format!(
                    "//*[self::input or self::select or self::textarea]\
                       [@id=//label[normalize-space()={lit}]/@for] \
                     | //label[normalize-space()={lit}]\
                       //*[self::input or self::select or self::textarea]"
                ))
            }
            Locator::Text(text) => By::XPath(format!(
                "//*[normalize-space(text())={}]",
                xpath_literal(text)
            )),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "css `{s}`"),
            Locator::Button(s) => write!(f, "button \"{s}\""),
            Locator::Link(s) => write!(f, "link \"{s}\""),
            Locator::Labeled(s) => write!(f, "field labeled \"{s}\""),
            Locator::Text(s) => write!(f, "text \"{s}\""),
        }
    }
}

/// XPath 1.0 has no escape syntax, so strings holding both quote kinds go through concat().
fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        return format!("'{value}'");
    }
    if !value.contains('"') {
        return format!("\"{value}\"");
    }
    let parts = value
        .split('\'')
        .map(|part| format!("'{part}'"))
        .collect::<Vec<_>>()
        .join(", \"'\", ");
    format!("concat({parts})")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// One browser session. Sessions are not shared between jurisdiction runs.
#[async_trait]
pub trait PortalSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), PortalError>;
    async fn fill(&mut self, target: &Locator, value: &str) -> Result<(), PortalError>;
    async fn click(&mut self, target: &Locator) -> Result<(), PortalError>;
    /// Pick an `<option>` by visible label.
    async fn select_option(&mut self, target: &Locator, label: &str) -> Result<(), PortalError>;
    async fn is_present(&mut self, target: &Locator) -> Result<bool, PortalError>;
    async fn wait_for(&mut self, target: &Locator, timeout: Duration) -> Result<(), PortalError>;
    /// Wait for the document to finish loading, then a fixed grace delay.
    async fn settle(&mut self, grace: Duration) -> Result<(), PortalError>;
    async fn page_source(&mut self) -> Result<String, PortalError>;
    async fn current_url(&mut self) -> Result<String, PortalError>;
    /// Click `trigger` and return the file the browser downloads in response.
    async fn download(
        &mut self,
        trigger: &Locator,
        timeout: Duration,
    ) -> Result<DownloadedFile, PortalError>;
    async fn close(&mut self) -> Result<(), PortalError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, jurisdiction_id: &str) -> Result<Box<dyn PortalSession>, PortalError>;
}

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub server_url: String,
    pub headless: bool,
    pub download_dir: PathBuf,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:9515".to_string(),
            headless: true,
            download_dir: std::env::temp_dir().join("sonar-downloads"),
        }
    }
}

/// Opens headless Chrome sessions through a running ChromeDriver.
#[derive(Debug, Clone)]
pub struct WebDriverSessionFactory {
    config: WebDriverConfig,
}

impl WebDriverSessionFactory {
    pub fn new(config: WebDriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for WebDriverSessionFactory {
    async fn open(&self, jurisdiction_id: &str) -> Result<Box<dyn PortalSession>, PortalError> {
        let download_dir = self.config.download_dir.join(jurisdiction_id);
        tokio::fs::create_dir_all(&download_dir)
            .await
            .map_err(|e| {
                PortalError::Download(format!("creating {}: {e}", download_dir.display()))
            })?;

        let mut caps = DesiredCapabilities::chrome();
        if self.config.headless {
            caps.add_arg("--headless=new").map_err(driver_error)?;
        }
        for arg in ["--no-sandbox", "--disable-dev-shm-usage", "--window-size=1920,1080"] {
            caps.add_arg(arg).map_err(driver_error)?;
        }
        caps.add_experimental_option(
            "prefs",
            json!({
                "download.default_directory": download_dir.to_string_lossy(),
                "download.prompt_for_download": false,
            }),
        )
        .map_err(driver_error)?;

        let driver = WebDriver::new(self.config.server_url.as_str(), caps)
            .await
            .map_err(|e| {
                PortalError::Driver(format!("connecting to {}: {e}", self.config.server_url))
            })?;
        info!(jurisdiction = jurisdiction_id, "browser session opened");

        Ok(Box::new(WebDriverSession {
            driver: Some(driver),
            download_dir,
        }))
    }
}

pub struct WebDriverSession {
    driver: Option<WebDriver>,
    download_dir: PathBuf,
}

impl WebDriverSession {
    fn driver(&self) -> Result<&WebDriver, PortalError> {
        self.driver
            .as_ref()
            .ok_or_else(|| PortalError::Driver("session already closed".to_string()))
    }

    async fn find(&self, target: &Locator) -> Result<WebElement, PortalError> {
        self.driver()?
            .query(target.to_by())
            .wait(ELEMENT_WAIT, POLL_INTERVAL)
            .first()
            .await
            .map_err(|_| PortalError::Navigation(target.to_string()))
    }
}

#[async_trait]
impl PortalSession for WebDriverSession {
    async fn goto(&mut self, url: &str) -> Result<(), PortalError> {
        debug!(url, "goto");
        self.driver()?.goto(url).await.map_err(driver_error)
    }

    async fn fill(&mut self, target: &Locator, value: &str) -> Result<(), PortalError> {
        let element = self.find(target).await?;
        element.clear().await.map_err(driver_error)?;
        element.send_keys(value).await.map_err(driver_error)
    }

    async fn click(&mut self, target: &Locator) -> Result<(), PortalError> {
        debug!(%target, "click");
        self.find(target).await?.click().await.map_err(driver_error)
    }

    async fn select_option(&mut self, target: &Locator, label: &str) -> Result<(), PortalError> {
        let select = self.find(target).await?;
        let option = select
            .find(By::XPath(format!(".//option[normalize-space()={}]", xpath_literal(label))))
            .await
            .map_err(|_| PortalError::Navigation(format!("option \"{label}\" in {target}")))?;
        option.click().await.map_err(driver_error)
    }

    async fn is_present(&mut self, target: &Locator) -> Result<bool, PortalError> {
        let found = self
            .driver()?
            .find_all(target.to_by())
            .await
            .map_err(driver_error)?;
        Ok(!found.is_empty())
    }

    async fn wait_for(&mut self, target: &Locator, timeout: Duration) -> Result<(), PortalError> {
        self.driver()?
            .query(target.to_by())
            .wait(timeout, POLL_INTERVAL)
            .first()
            .await
            .map(|_| ())
            .map_err(|_| PortalError::Timeout {
                what: target.to_string(),
                waited: timeout,
            })
    }

    async fn settle(&mut self, grace: Duration) -> Result<(), PortalError> {
        let deadline = Instant::now() + RESULTS_WAIT;
        loop {
            let ret = self
                .driver()?
                .execute("return document.readyState;", Vec::new())
                .await
                .map_err(driver_error)?;
            if ret.json().as_str() == Some("complete") {
                break;
            }
            if Instant::now() >= deadline {
                return Err(PortalError::Timeout {
                    what: "document load".to_string(),
                    waited: RESULTS_WAIT,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        tokio::time::sleep(grace).await;
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String, PortalError> {
        self.driver()?.source().await.map_err(driver_error)
    }

    async fn current_url(&mut self) -> Result<String, PortalError> {
        Ok(self.driver()?.current_url().await.map_err(driver_error)?.to_string())
    }

    async fn download(
        &mut self,
        trigger: &Locator,
        timeout: Duration,
    ) -> Result<DownloadedFile, PortalError> {
        let before = list_files(&self.download_dir).await?;
        self.click(trigger).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let now = list_files(&self.download_dir).await?;
            let finished = now
                .difference(&before)
                .find(|name| !name.ends_with(".crdownload") && !name.ends_with(".tmp"));
            if let Some(name) = finished {
                let path = self.download_dir.join(name);
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    PortalError::Download(format!("reading {}: {e}", path.display()))
                })?;
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %err, "could not remove downloaded file");
                }
                return Ok(DownloadedFile {
                    file_name: name.clone(),
                    bytes,
                });
            }
            if Instant::now() >= deadline {
                return Err(PortalError::Timeout {
                    what: format!("download from {trigger}"),
                    waited: timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn close(&mut self) -> Result<(), PortalError> {
        match self.driver.take() {
            Some(driver) => driver.quit().await.map_err(driver_error),
            None => Ok(()),
        }
    }
}

async fn list_files(dir: &Path) -> Result<BTreeSet<String>, PortalError> {
    let io_err =
        |e: std::io::Error| PortalError::Download(format!("listing {}: {e}", dir.display()));
    let mut names = BTreeSet::new();
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        if let Some(name) = entry.file_name().to_str() {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

#[derive(Clone)]
pub struct PortalCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Outcome for one scraped row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowExtract {
    Record(SolicitationRecord),
    /// Fewer cells than the layout needs; skipped silently.
    Short { row: usize, cells: usize, expected: usize },
    Invalid { row: usize, error: RowParseError },
}

/// Raw bytes the portal produced, kept for debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    pub extension: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub rows: Vec<RowExtract>,
    pub capture: Option<RawCapture>,
}

impl Extraction {
    pub fn records(&self) -> impl Iterator<Item = &SolicitationRecord> {
        self.rows.iter().filter_map(|row| match row {
            RowExtract::Record(record) => Some(record),
            _ => None,
        })
    }
}

/// One procurement portal: how to log in, reach the open listings, and read them.
#[async_trait]
pub trait Jurisdiction: Send + Sync {
    fn id(&self) -> &str;
    fn display_name(&self) -> &str;
    fn entry_url(&self) -> &str;
    fn requires_login(&self) -> bool;

    /// Called on the entry page. Portals without login ignore `credentials`.
    async fn login(
        &self,
        session: &mut dyn PortalSession,
        credentials: Option<&PortalCredentials>,
    ) -> Result<(), PortalError>;

    async fn navigate(&self, session: &mut dyn PortalSession) -> Result<(), PortalError>;

    async fn extract(&self, session: &mut dyn PortalSession) -> Result<Extraction, PortalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortalKind {
    KentuckyVss,
    PennsylvaniaEmarketplace,
    MassachusettsCommbuys,
}

impl PortalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PortalKind::KentuckyVss => "kentucky-vss",
            PortalKind::PennsylvaniaEmarketplace => "pennsylvania-emarketplace",
            PortalKind::MassachusettsCommbuys => "massachusetts-commbuys",
        }
    }

    pub fn requires_login(self) -> bool {
        !matches!(self, PortalKind::PennsylvaniaEmarketplace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalProfile {
    pub id: String,
    pub display_name: String,
    pub entry_url: String,
}

pub fn portal_for(kind: PortalKind, profile: PortalProfile) -> Box<dyn Jurisdiction> {
    match kind {
        PortalKind::KentuckyVss => Box::new(KentuckyVss { profile }),
        PortalKind::PennsylvaniaEmarketplace => Box::new(PennsylvaniaEmarketplace { profile }),
        PortalKind::MassachusettsCommbuys => Box::new(MassachusettsCommbuys { profile }),
    }
}

fn require_credentials<'a>(
    portal: &str,
    credentials: Option<&'a PortalCredentials>,
) -> Result<&'a PortalCredentials, PortalError> {
    credentials.ok_or_else(|| {
        PortalError::Authentication(format!("{portal} requires portal credentials"))
    })
}

/// Wait for an element that only exists once login succeeded.
async fn confirm_login(
    session: &mut dyn PortalSession,
    landmark: &Locator,
    portal: &str,
) -> Result<(), PortalError> {
    match session.wait_for(landmark, ELEMENT_WAIT).await {
        Ok(()) => Ok(()),
        Err(PortalError::Timeout { .. }) => Err(PortalError::Authentication(format!(
            "{portal} did not show {landmark} after sign-in"
        ))),
        Err(err) => Err(err),
    }
}

// CGI Advantage VSS (vss.ky.gov)

const KY_RESULTS_ROWS: &str = "table[summary='Search Results'] > tbody > tr";
const KY_MIN_CELLS: usize = 5;
const KY_STATUS_FILTER: &str = "select[name*='Status']";

#[derive(Debug, Clone)]
pub struct KentuckyVss {
    profile: PortalProfile,
}

#[async_trait]
impl Jurisdiction for KentuckyVss {
    fn id(&self) -> &str {
        &self.profile.id
    }

    fn display_name(&self) -> &str {
        &self.profile.display_name
    }

    fn entry_url(&self) -> &str {
        &self.profile.entry_url
    }

    fn requires_login(&self) -> bool {
        true
    }

    async fn login(
        &self,
        session: &mut dyn PortalSession,
        credentials: Option<&PortalCredentials>,
    ) -> Result<(), PortalError> {
        let creds = require_credentials(self.display_name(), credentials)?;
        session.settle(SETTLE_GRACE).await?;
        session.wait_for(&Locator::labeled("User ID"), ELEMENT_WAIT).await?;
        session.fill(&Locator::labeled("User ID"), &creds.username).await?;
        session.fill(&Locator::labeled("Password"), &creds.password).await?;
        session.click(&Locator::button("Sign In")).await?;
        session.settle(SETTLE_GRACE).await?;
        confirm_login(session, &Locator::link("Published Solicitations"), self.display_name()).await
    }

    async fn navigate(&self, session: &mut dyn PortalSession) -> Result<(), PortalError> {
        session.click(&Locator::link("Published Solicitations")).await?;
        session.settle(SETTLE_GRACE).await?;

        let disclaimer = Locator::button("I Agree");
        if session.is_present(&disclaimer).await? {
            session.click(&disclaimer).await?;
            session.settle(SETTLE_GRACE).await?;
        }

        let status = Locator::css(KY_STATUS_FILTER);
        if session.is_present(&status).await? {
            session.select_option(&status, "Open").await?;
            session.click(&Locator::button("Search")).await?;
            session.settle(SETTLE_GRACE).await?;
        } else {
            debug!("status filter not shown; listing is already open solicitations");
        }

        session.wait_for(&Locator::css(KY_RESULTS_ROWS), RESULTS_WAIT).await
    }

    async fn extract(&self, session: &mut dyn PortalSession) -> Result<Extraction, PortalError> {
        let html = session.page_source().await?;
        let base = session.current_url().await?;
        Ok(Extraction {
            rows: parse_kentucky_results(&html, &base)?,
            capture: None,
        })
    }
}

/// Columns: 1 description, 2 department, 3 solicitation number (first line), 4 closing date.
pub fn parse_kentucky_results(html: &str, base_url: &str) -> Result<Vec<RowExtract>, PortalError> {
    table_rows(html, KY_RESULTS_ROWS, KY_MIN_CELLS, |row, cells| {
        let number = first_fragment(&cells[3])
            .ok_or(RowParseError::MissingField("solicitation number"))?;
        let description = cell_text(&cells[1]);
        let closing_raw = cell_text(&cells[4]);
        let detail_url = first_href(&cells[3])
            .or_else(|| first_href(&cells[1]))
            .and_then(|href| resolve_link(base_url, &href));
        debug!(row, %number, "kentucky row");
        Ok(SolicitationRecord {
            title: description.clone(),
            solicitation_type: number.split('-').next().map(str::to_string),
            solicitation_number: number,
            closing_date: parse_closing_date(&closing_raw).ok(),
            closing_date_raw: closing_raw,
            description,
            detail_url,
            department: text_or_none(&cell_text(&cells[2])),
            buyer_name: None,
        })
    })
}

// eMARKETPLACE (emarketplace.state.pa.us)

const PA_RECORDS_PER_PAGE: &str = "select[name*='ddlRecordsPerPage']";
const PA_EXPORT: &str = "Export Search Results";

#[derive(Debug, Clone)]
pub struct PennsylvaniaEmarketplace {
    profile: PortalProfile,
}

#[async_trait]
impl Jurisdiction for PennsylvaniaEmarketplace {
    fn id(&self) -> &str {
        &self.profile.id
    }

    fn display_name(&self) -> &str {
        &self.profile.display_name
    }

    fn entry_url(&self) -> &str {
        &self.profile.entry_url
    }

    fn requires_login(&self) -> bool {
        false
    }

    async fn login(
        &self,
        _session: &mut dyn PortalSession,
        _credentials: Option<&PortalCredentials>,
    ) -> Result<(), PortalError> {
        Ok(())
    }

    async fn navigate(&self, session: &mut dyn PortalSession) -> Result<(), PortalError> {
        session.settle(SETTLE_GRACE).await?;
        let per_page = Locator::css(PA_RECORDS_PER_PAGE);
        if session.is_present(&per_page).await? {
            session.select_option(&per_page, "ALL").await?;
            session.settle(SETTLE_GRACE).await?;
        } else {
            warn!("records-per-page selector missing; exporting the default page size");
        }
        session.wait_for(&Locator::text(PA_EXPORT), RESULTS_WAIT).await
    }

    async fn extract(&self, session: &mut dyn PortalSession) -> Result<Extraction, PortalError> {
        let file = session.download(&Locator::text(PA_EXPORT), DOWNLOAD_WAIT).await?;
        info!(file = %file.file_name, bytes = file.bytes.len(), "export downloaded");
        let rows = parse_pennsylvania_export(&file.bytes, self.entry_url())?;
        Ok(Extraction {
            rows,
            capture: Some(RawCapture {
                extension: "csv",
                bytes: file.bytes,
            }),
        })
    }
}

/// Parse the "Export Search Results" CSV. Columns are found by header name.
pub fn parse_pennsylvania_export(
    bytes: &[u8],
    entry_url: &str,
) -> Result<Vec<RowExtract>, PortalError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| PortalError::Export(e.to_string()))?
        .clone();
    let column = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let required = |name: &str| {
        column(name).ok_or_else(|| PortalError::Export(format!("missing `{name}` column")))
    };
    let bid_no = required("Bid No")?;
    let title = required("Title")?;
    let bid_type = column("Bid Type");
    let description = column("Description");
    let agency = column("Agency");
    let end_date = column("Bid End Date");
    let buyer = column("Buyer Name");

    let mut rows = Vec::new();
    for (row, record) in reader.byte_records().enumerate() {
        let record = record.map_err(|e| PortalError::Export(e.to_string()))?;
        // Exports occasionally carry Windows-1252 bytes; such a row is skipped, not the file.
        let record = match csv::StringRecord::from_byte_record(record) {
            Ok(record) => record,
            Err(err) => {
                rows.push(RowExtract::Invalid {
                    row,
                    error: RowParseError::Malformed(err.to_string()),
                });
                continue;
            }
        };
        if record.len() < headers.len() {
            rows.push(RowExtract::Short {
                row,
                cells: record.len(),
                expected: headers.len(),
            });
            continue;
        }
        let get = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or_default();

        let number = get(Some(bid_no));
        if number.is_empty() {
            rows.push(RowExtract::Invalid {
                row,
                error: RowParseError::MissingField("Bid No"),
            });
            continue;
        }
        let title_text = get(Some(title));
        let body = match (title_text, get(description)) {
            (t, d) if !t.is_empty() && !d.is_empty() => format!("{t}\n\n{d}"),
            (t, d) if t.is_empty() => d.to_string(),
            (t, _) => t.to_string(),
        };
        let closing_raw = get(end_date).to_string();

        rows.push(RowExtract::Record(SolicitationRecord {
            title: title_text.to_string(),
            solicitation_number: number.to_string(),
            closing_date: parse_closing_date(&closing_raw).ok(),
            closing_date_raw: closing_raw,
            description: body,
            detail_url: resolve_link(entry_url, &format!("Solicitations.aspx?SID={number}")),
            department: text_or_none(get(agency)),
            buyer_name: text_or_none(get(buyer)),
            solicitation_type: text_or_none(get(bid_type)),
        }));
    }
    Ok(rows)
}

// COMMBUYS (commbuys.com)

const MA_ROWS: &str = "table tbody tr";
const MA_MIN_CELLS: usize = 8;
const MA_LOGIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MassachusettsCommbuys {
    profile: PortalProfile,
}

#[async_trait]
impl Jurisdiction for MassachusettsCommbuys {
    fn id(&self) -> &str {
        &self.profile.id
    }

    fn display_name(&self) -> &str {
        &self.profile.display_name
    }

    fn entry_url(&self) -> &str {
        &self.profile.entry_url
    }

    fn requires_login(&self) -> bool {
        true
    }

    async fn login(
        &self,
        session: &mut dyn PortalSession,
        credentials: Option<&PortalCredentials>,
    ) -> Result<(), PortalError> {
        let creds = require_credentials(self.display_name(), credentials)?;
        session.settle(SETTLE_GRACE).await?;
        session.click(&Locator::button("Sign In")).await?;
        session.wait_for(&Locator::labeled("User ID"), ELEMENT_WAIT).await?;
        session.fill(&Locator::labeled("User ID"), &creds.username).await?;
        session.fill(&Locator::labeled("Password"), &creds.password).await?;
        session.click(&Locator::button("Sign In")).await?;
        session.settle(MA_LOGIN_GRACE).await?;
        confirm_login(session, &Locator::link("Bids"), self.display_name()).await
    }

    async fn navigate(&self, session: &mut dyn PortalSession) -> Result<(), PortalError> {
        session.click(&Locator::link("Bids")).await?;
        session.settle(SETTLE_GRACE).await?;
        session.click(&Locator::text("View More")).await?;
        session.settle(Duration::from_secs(3)).await?;
        session.wait_for(&Locator::css(MA_ROWS), RESULTS_WAIT).await
    }

    async fn extract(&self, session: &mut dyn PortalSession) -> Result<Extraction, PortalError> {
        let html = session.page_source().await?;
        let base = session.current_url().await?;
        Ok(Extraction {
            rows: parse_massachusetts_bids(&html, &base)?,
            capture: None,
        })
    }
}

/// Columns: 0 bid number (link), 1 organization, 3 buyer, 4 description,
/// 5 purchase method, 6 bid opening date.
pub fn parse_massachusetts_bids(
    html: &str,
    base_url: &str,
) -> Result<Vec<RowExtract>, PortalError> {
    table_rows(html, MA_ROWS, MA_MIN_CELLS, |_, cells| {
        let number = text_or_none(&cell_text(&cells[0]))
            .ok_or(RowParseError::MissingField("bid number"))?;
        let description = cell_text(&cells[4]);
        let closing_raw = cell_text(&cells[6]);
        Ok(SolicitationRecord {
            title: description.clone(),
            solicitation_number: number,
            closing_date: parse_closing_date(&closing_raw).ok(),
            closing_date_raw: closing_raw,
            description,
            detail_url: first_href(&cells[0]).and_then(|href| resolve_link(base_url, &href)),
            department: text_or_none(&cell_text(&cells[1])),
            buyer_name: text_or_none(&cell_text(&cells[3])),
            solicitation_type: text_or_none(&cell_text(&cells[5])),
        })
    })
}

/// Walk `<tr>` rows matched by `row_selector`. Rows without `<td>` cells (headers) are
/// ignored, rows with fewer than `min_cells` become `Short`.
fn table_rows<F>(
    html: &str,
    row_selector: &str,
    min_cells: usize,
    mut parse_row: F,
) -> Result<Vec<RowExtract>, PortalError>
where
    F: FnMut(usize, &[ElementRef<'_>]) -> Result<SolicitationRecord, RowParseError>,
{
    let document = Html::parse_document(html);
    let rows_sel =
        Selector::parse(row_selector).map_err(|e| PortalError::Navigation(e.to_string()))?;
    let cell_sel = Selector::parse("td").map_err(|e| PortalError::Navigation(e.to_string()))?;

    let mut out = Vec::new();
    for (row, tr) in document.select(&rows_sel).enumerate() {
        let cells: Vec<ElementRef<'_>> = tr.select(&cell_sel).collect();
        if cells.is_empty() {
            continue;
        }
        if cells.len() < min_cells {
            out.push(RowExtract::Short {
                row,
                cells: cells.len(),
                expected: min_cells,
            });
            continue;
        }
        out.push(match parse_row(row, &cells) {
            Ok(record) => RowExtract::Record(record),
            Err(error) => RowExtract::Invalid { row, error },
        });
    }
    Ok(out)
}

/// Cell text with whitespace runs collapsed.
fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// First non-blank text node, i.e. the first visual line of a cell.
fn first_fragment(cell: &ElementRef<'_>) -> Option<String> {
    cell.text().find_map(text_or_none)
}

fn first_href(cell: &ElementRef<'_>) -> Option<String> {
    let sel = Selector::parse("a[href]").ok()?;
    cell.select(&sel)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(text_or_none)
}
