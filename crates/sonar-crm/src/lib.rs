//! CRM client: OAuth token cache plus the handful of Salesforce REST calls the sync needs.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sonar_core::{AccountId, AccountStatusUpdate, OpportunityPayload};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "sonar-crm";

pub const DEFAULT_API_VERSION: &str = "v65.0";
pub const DEFAULT_LOGIN_URL: &str = "https://login.salesforce.com";
/// Access tokens live about two hours; refresh well before that.
pub const TOKEN_VALIDITY: Duration = Duration::from_secs(90 * 60);
/// Account field holding the jurisdiction code (`KY`, `PA`, ...).
pub const ACCOUNT_CODE_FIELD: &str = "Billing_State_Code__c";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CrmFieldError {
    pub message: String,
    #[serde(rename = "errorCode", default)]
    pub error_code: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("CRM authentication failed: {0}")]
    Auth(String),
    #[error("{0}")]
    NotFound(String),
    #[error("CRM rejected the request (HTTP {status}): {}", summarize_field_errors(.errors))]
    Validation {
        status: u16,
        errors: Vec<CrmFieldError>,
    },
    #[error("transient CRM failure: {0}")]
    Transient(String),
    #[error("unexpected CRM response: {0}")]
    Decode(String),
}

fn summarize_field_errors(errors: &[CrmFieldError]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.error_code.is_empty() {
                e.message.clone()
            } else {
                format!("{}: {}", e.error_code, e.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// The CRM operations a jurisdiction run depends on. Implementations do not retry.
#[async_trait]
pub trait CrmClient: Send + Sync {
    /// The unique Account whose jurisdiction code matches; zero or several is `NotFound`.
    async fn find_account_id(&self, jurisdiction_code: &str) -> Result<AccountId, CrmError>;

    /// Every solicitation identifier already linked to the account (empty set when none).
    async fn fetch_existing_identifiers(
        &self,
        account_id: &AccountId,
    ) -> Result<HashSet<String>, CrmError>;

    /// Insert one Opportunity and return its CRM id.
    async fn create_opportunity(&self, payload: &OpportunityPayload) -> Result<String, CrmError>;

    async fn update_account_status(
        &self,
        account_id: &AccountId,
        update: &AccountStatusUpdate,
    ) -> Result<(), CrmError>;
}

#[derive(Clone)]
pub enum CrmAuth {
    /// OAuth refresh-token grant against the login host.
    RefreshToken {
        login_url: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    /// Pre-issued bearer token (legacy `SALESFORCE_API_KEY`).
    StaticToken(String),
}

impl std::fmt::Debug for CrmAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrmAuth::RefreshToken {
                login_url,
                client_id,
                ..
            } => f
                .debug_struct("RefreshToken")
                .field("login_url", login_url)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .field("refresh_token", &"<redacted>")
                .finish(),
            CrmAuth::StaticToken(_) => f.write_str("StaticToken(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub instance_url: String,
    pub api_version: String,
    pub auth: CrmAuth,
    pub timeout: Duration,
    pub token_validity: Duration,
}

impl CrmConfig {
    pub fn new(instance_url: impl Into<String>, auth: CrmAuth) -> Self {
        Self {
            instance_url: instance_url.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            auth,
            timeout: Duration::from_secs(30),
            token_validity: TOKEN_VALIDITY,
        }
    }
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct QueryPage<T> {
    #[serde(rename = "totalSize", default)]
    total_size: u64,
    #[serde(default = "default_true")]
    done: bool,
    #[serde(rename = "nextRecordsUrl", default)]
    next_records_url: Option<String>,
    #[serde(default = "Vec::new")]
    records: Vec<T>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct IdRecord {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct SolicitationNumberRecord {
    #[serde(rename = "Solicitation_Number__c", default)]
    solicitation_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

/// Recently created opportunity, as listed by [`SalesforceClient::opportunity_overview`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpportunityListing {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Solicitation_Number__c", default)]
    pub solicitation_number: Option<String>,
    #[serde(rename = "CreatedDate")]
    pub created_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpportunityOverview {
    pub total: u64,
    pub recent: Vec<OpportunityListing>,
}

/// Quote a value as a SOQL string literal.
pub fn soql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn classify_status(status: StatusCode, body: &str) -> CrmError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return CrmError::Auth(format!("HTTP {status}: {body}"));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return CrmError::Transient(format!("HTTP {status}: {body}"));
    }
    let errors = serde_json::from_str::<Vec<CrmFieldError>>(body).unwrap_or_else(|_| {
        vec![CrmFieldError {
            message: body.to_string(),
            error_code: String::new(),
            fields: Vec::new(),
        }]
    });
    CrmError::Validation {
        status: status.as_u16(),
        errors,
    }
}

fn transport_error(err: reqwest::Error) -> CrmError {
    if err.is_decode() {
        CrmError::Decode(err.to_string())
    } else {
        CrmError::Transient(err.to_string())
    }
}

pub struct SalesforceClient {
    http: reqwest::Client,
    config: CrmConfig,
    token: Mutex<Option<CachedToken>>,
}

impl SalesforceClient {
    pub fn new(config: CrmConfig) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CrmError::Transient(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    fn data_url(&self) -> String {
        format!(
            "{}/services/data/{}",
            self.config.instance_url.trim_end_matches('/'),
            self.config.api_version
        )
    }

    /// Return a usable bearer token, refreshing it once the validity window has passed.
    pub async fn authenticate(&self) -> Result<String, CrmError> {
        let (login_url, client_id, client_secret, refresh_token) = match &self.config.auth {
            CrmAuth::StaticToken(token) => return Ok(token.clone()),
            CrmAuth::RefreshToken {
                login_url,
                client_id,
                client_secret,
                refresh_token,
            } => (login_url, client_id, client_secret, refresh_token),
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.fetched_at.elapsed() < self.config.token_validity {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!("{}/services/oauth2/token", login_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                CrmError::Transient(format!("token endpoint HTTP {status}: {body}"))
            } else {
                CrmError::Auth(format!("token refresh rejected (HTTP {status}): {body}"))
            });
        }

        let token: TokenResponse = resp.json().await.map_err(transport_error)?;
        info!("refreshed CRM access token");
        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token.access_token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, CrmError> {
        let token = self.authenticate().await?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let err = classify_status(status, &body);
        if matches!(err, CrmError::Auth(_)) {
            // Revoked mid-window; the next call refreshes instead of reusing it.
            self.token.lock().await.take();
        }
        Err(err)
    }

    async fn query_page<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<QueryPage<T>, CrmError> {
        self.send(request)
            .await?
            .json::<QueryPage<T>>()
            .await
            .map_err(transport_error)
    }

    /// Run a SOQL query, following `nextRecordsUrl` until the result set is exhausted.
    async fn query_all<T: DeserializeOwned>(&self, soql: &str) -> Result<Vec<T>, CrmError> {
        debug!(soql, "CRM query");
        let first = self.http.get(format!("{}/query/", self.data_url())).query(&[("q", soql)]);
        let mut page: QueryPage<T> = self.query_page(first).await?;
        let mut records = std::mem::take(&mut page.records);

        while !page.done {
            let Some(next) = page.next_records_url.take() else {
                break;
            };
            let url = format!("{}{}", self.config.instance_url.trim_end_matches('/'), next);
            page = self.query_page(self.http.get(url)).await?;
            records.append(&mut page.records);
        }
        Ok(records)
    }

    /// Opportunity count for the account plus the three most recently created.
    pub async fn opportunity_overview(
        &self,
        account_id: &AccountId,
    ) -> Result<OpportunityOverview, CrmError> {
        let account = soql_literal(account_id.as_str());
        let count_soql = format!("SELECT COUNT() FROM Opportunity WHERE AccountId = {account}");
        let count_req = self
            .http
            .get(format!("{}/query/", self.data_url()))
            .query(&[("q", count_soql.as_str())]);
        let count: QueryPage<serde_json::Value> = self.query_page(count_req).await?;

        let recent_soql = format!(
            "SELECT Name, Solicitation_Number__c, CreatedDate FROM Opportunity \
             WHERE AccountId = {account} ORDER BY CreatedDate DESC LIMIT 3"
        );
        let recent = self.query_all::<OpportunityListing>(&recent_soql).await?;
        Ok(OpportunityOverview {
            total: count.total_size,
            recent,
        })
    }
}

#[async_trait]
impl CrmClient for SalesforceClient {
    async fn find_account_id(&self, jurisdiction_code: &str) -> Result<AccountId, CrmError> {
        let soql = format!(
            "SELECT Id FROM Account WHERE {ACCOUNT_CODE_FIELD} = {}",
            soql_literal(jurisdiction_code)
        );
        let mut matches = self.query_all::<IdRecord>(&soql).await?;
        match matches.len() {
            1 => Ok(AccountId::new(matches.remove(0).id)),
            0 => Err(CrmError::NotFound(format!(
                "no Account with {ACCOUNT_CODE_FIELD} = '{jurisdiction_code}'"
            ))),
            n => Err(CrmError::NotFound(format!(
                "{n} Accounts with {ACCOUNT_CODE_FIELD} = '{jurisdiction_code}'; \
                 expected exactly one"
            ))),
        }
    }

    async fn fetch_existing_identifiers(
        &self,
        account_id: &AccountId,
    ) -> Result<HashSet<String>, CrmError> {
        let soql = format!(
            "SELECT Solicitation_Number__c FROM Opportunity WHERE AccountId = {}",
            soql_literal(account_id.as_str())
        );
        let records = self.query_all::<SolicitationNumberRecord>(&soql).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| r.solicitation_number)
            .filter(|n| !n.trim().is_empty())
            .collect())
    }

    async fn create_opportunity(&self, payload: &OpportunityPayload) -> Result<String, CrmError> {
        let request = self
            .http
            .post(format!("{}/sobjects/Opportunity", self.data_url()))
            .json(payload);
        let created: CreateResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(created.id)
    }

    async fn update_account_status(
        &self,
        account_id: &AccountId,
        update: &AccountStatusUpdate,
    ) -> Result<(), CrmError> {
        let request = self
            .http
            .patch(format!("{}/sobjects/Account/{}", self.data_url(), account_id))
            .json(update);
        self.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Form, Path, Query, State};
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{get, patch, post};
    use axum::{Json, Router};
    use chrono::{NaiveDate, TimeZone};
    use serde_json::{json, Value};

    #[derive(Clone, Default)]
    struct FakeSalesforce {
        token_calls: Arc<AtomicUsize>,
        revoked: Arc<std::sync::Mutex<Vec<String>>>,
        patches: Arc<std::sync::Mutex<Vec<(String, Value)>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("Bearer "))
    }

    async fn token(
        State(state): State<FakeSalesforce>,
        Form(form): Form<HashMap<String, String>>,
    ) -> AxumResponse {
        let n = state.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if form.get("refresh_token").map(String::as_str) == Some("good-refresh") {
            Json(json!({ "access_token": format!("tok-{n}"), "token_type": "Bearer" }))
                .into_response()
        } else {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_grant",
                    "error_description": "expired access/refresh token"
                })),
            )
                .into_response()
        }
    }

    async fn query(
        State(state): State<FakeSalesforce>,
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> AxumResponse {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default();
        if state.revoked.lock().unwrap().iter().any(|t| t == bearer) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!([{
                    "message": "Session expired or invalid",
                    "errorCode": "INVALID_SESSION_ID"
                }])),
            )
                .into_response();
        }
        let q = params.get("q").cloned().unwrap_or_default();
        if q.contains("FROM Account") {
            let records = if q.contains("'KY'") {
                json!([{ "Id": "001KY" }])
            } else if q.contains("'DUP'") {
                json!([{ "Id": "001A" }, { "Id": "001B" }])
            } else {
                json!([])
            };
            return Json(json!({ "totalSize": 1, "done": true, "records": records }))
                .into_response();
        }
        if q.starts_with("SELECT COUNT()") {
            return Json(json!({ "totalSize": 42, "done": true, "records": [] })).into_response();
        }
        if q.contains("ORDER BY CreatedDate") {
            return Json(json!({
                "totalSize": 1,
                "done": true,
                "records": [{
                    "Name": "Road Salt",
                    "Solicitation_Number__c": "6100001",
                    "CreatedDate": "2026-10-17T06:00:00Z"
                }]
            }))
            .into_response();
        }
        Json(json!({
            "totalSize": 3,
            "done": false,
            "nextRecordsUrl": "/services/data/v65.0/query/01g-2000",
            "records": [{ "Solicitation_Number__c": "RFB-1" }, { "Solicitation_Number__c": null }]
        }))
        .into_response()
    }

    async fn query_more(headers: HeaderMap, Path(cursor): Path<String>) -> AxumResponse {
        if !authorized(&headers) || cursor != "01g-2000" {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Json(json!({
            "totalSize": 3,
            "done": true,
            "records": [{ "Solicitation_Number__c": "RFB-2" }]
        }))
        .into_response()
    }

    async fn create(headers: HeaderMap, Json(body): Json<Value>) -> AxumResponse {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        if body["Solicitation_Number__c"] == "BOOM" {
            return (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response();
        }
        if body["Name"].as_str().unwrap_or_default().is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!([{
                    "message": "Required fields are missing: [Name]",
                    "errorCode": "REQUIRED_FIELD_MISSING",
                    "fields": ["Name"]
                }])),
            )
                .into_response();
        }
        let body = json!({ "id": "006NEW", "success": true, "errors": [] });
        (StatusCode::CREATED, Json(body)).into_response()
    }

    async fn update_account(
        State(state): State<FakeSalesforce>,
        headers: HeaderMap,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> AxumResponse {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        state.patches.lock().unwrap().push((id, body));
        StatusCode::NO_CONTENT.into_response()
    }

    async fn spawn_fake() -> (String, FakeSalesforce) {
        let state = FakeSalesforce::default();
        let app = Router::new()
            .route("/services/oauth2/token", post(token))
            .route("/services/data/v65.0/query/", get(query))
            .route("/services/data/v65.0/query/{cursor}", get(query_more))
            .route("/services/data/v65.0/sobjects/Opportunity", post(create))
            .route("/services/data/v65.0/sobjects/Account/{id}", patch(update_account))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    fn client(base: &str, refresh_token: &str, validity: Duration) -> SalesforceClient {
        let mut config = CrmConfig::new(
            base,
            CrmAuth::RefreshToken {
                login_url: base.to_string(),
                client_id: "client".into(),
                client_secret: "secret".into(),
                refresh_token: refresh_token.into(),
            },
        );
        config.timeout = Duration::from_secs(5);
        config.token_validity = validity;
        SalesforceClient::new(config).unwrap()
    }

    fn payload(number: &str, name: &str) -> OpportunityPayload {
        OpportunityPayload {
            account_id: AccountId::new("001KY"),
            name: name.into(),
            solicitation_number: number.into(),
            close_date: NaiveDate::from_ymd_opt(2026, 11, 1).unwrap(),
            stage_name: "Prospecting".into(),
            solicitation_type: "Other".into(),
            category: "Other".into(),
            department: None,
            buyer_name: None,
            portal_url: "https://vss.ky.gov/".into(),
            data_source: "Automated Scraper".into(),
            response_status: "New - Not Reviewed".into(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn token_is_reused_within_validity_window() {
        let (base, fake) = spawn_fake().await;
        let crm = client(&base, "good-refresh", TOKEN_VALIDITY);
        assert_eq!(crm.authenticate().await.unwrap(), "tok-1");
        crm.find_account_id("KY").await.unwrap();
        assert_eq!(crm.authenticate().await.unwrap(), "tok-1");
        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let (base, fake) = spawn_fake().await;
        let crm = client(&base, "good-refresh", Duration::ZERO);
        assert_eq!(crm.authenticate().await.unwrap(), "tok-1");
        assert_eq!(crm.authenticate().await.unwrap(), "tok-2");
        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn revoked_refresh_token_is_an_auth_error() {
        let (base, _fake) = spawn_fake().await;
        let crm = client(&base, "revoked", TOKEN_VALIDITY);
        let err = crm.find_account_id("KY").await.unwrap_err();
        assert!(matches!(err, CrmError::Auth(ref msg) if msg.contains("invalid_grant")), "{err}");
    }

    #[tokio::test]
    async fn token_rejected_mid_window_is_dropped_from_the_cache() {
        let (base, fake) = spawn_fake().await;
        let crm = client(&base, "good-refresh", TOKEN_VALIDITY);
        crm.find_account_id("KY").await.unwrap();

        fake.revoked.lock().unwrap().push("tok-1".into());
        let err = crm.find_account_id("KY").await.unwrap_err();
        assert!(
            matches!(err, CrmError::Auth(ref msg) if msg.contains("INVALID_SESSION_ID")),
            "{err}"
        );
        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 1);

        assert_eq!(crm.find_account_id("KY").await.unwrap(), AccountId::new("001KY"));
        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 2);
        assert_eq!(crm.authenticate().await.unwrap(), "tok-2");
    }

    #[tokio::test]
    async fn static_token_skips_the_token_endpoint() {
        let (base, fake) = spawn_fake().await;
        let config = CrmConfig::new(&base, CrmAuth::StaticToken("legacy".into()));
        let crm = SalesforceClient::new(config).unwrap();
        assert_eq!(crm.find_account_id("KY").await.unwrap(), AccountId::new("001KY"));
        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn account_lookup_requires_exactly_one_match() {
        let (base, _fake) = spawn_fake().await;
        let crm = client(&base, "good-refresh", TOKEN_VALIDITY);
        assert_eq!(crm.find_account_id("KY").await.unwrap(), AccountId::new("001KY"));
        assert!(matches!(crm.find_account_id("ZZ").await, Err(CrmError::NotFound(_))));
        let err = crm.find_account_id("DUP").await.unwrap_err();
        assert!(err.to_string().contains("expected exactly one"));
    }

    #[tokio::test]
    async fn existing_identifiers_follow_pagination() {
        let (base, _fake) = spawn_fake().await;
        let crm = client(&base, "good-refresh", TOKEN_VALIDITY);
        let ids = crm.fetch_existing_identifiers(&AccountId::new("001KY")).await.unwrap();
        let expected: HashSet<String> = ["RFB-1", "RFB-2"].into_iter().map(String::from).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn create_maps_status_codes_onto_error_kinds() {
        let (base, _fake) = spawn_fake().await;
        let crm = client(&base, "good-refresh", TOKEN_VALIDITY);

        assert_eq!(crm.create_opportunity(&payload("RFB-9", "Road Salt")).await.unwrap(), "006NEW");

        match crm.create_opportunity(&payload("RFB-10", "")).await.unwrap_err() {
            CrmError::Validation { status, errors } => {
                assert_eq!(status, 400);
                assert_eq!(errors[0].error_code, "REQUIRED_FIELD_MISSING");
                assert_eq!(errors[0].fields, vec!["Name".to_string()]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }

        assert!(matches!(
            crm.create_opportunity(&payload("BOOM", "Road Salt")).await,
            Err(CrmError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn account_status_is_patched_with_picklist_value() {
        let (base, fake) = spawn_fake().await;
        let crm = client(&base, "good-refresh", TOKEN_VALIDITY);
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 6, 30, 0).single().unwrap();
        let update = AccountStatusUpdate::failed(at, "login failed");
        crm.update_account_status(&AccountId::new("001KY"), &update)
            .await
            .unwrap();

        let patches = fake.patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "001KY");
        assert_eq!(patches[0].1["Scrape_Status__c"], "Failed");
        assert_eq!(patches[0].1["Scrape_Error__c"], "login failed");
    }

    #[tokio::test]
    async fn overview_reports_count_and_recent_records() {
        let (base, _fake) = spawn_fake().await;
        let crm = client(&base, "good-refresh", TOKEN_VALIDITY);
        let overview = crm.opportunity_overview(&AccountId::new("001PA")).await.unwrap();
        assert_eq!(overview.total, 42);
        assert_eq!(overview.recent.len(), 1);
        assert_eq!(overview.recent[0].solicitation_number.as_deref(), Some("6100001"));
    }

    #[test]
    fn soql_literals_are_escaped() {
        assert_eq!(soql_literal("KY"), "'KY'");
        assert_eq!(soql_literal("O'Brien"), "'O\\'Brien'");
        assert_eq!(soql_literal("a\\b"), "'a\\\\b'");
    }
}
