//! Read-only access to Google Sheets tabs
//!
//! Authentication uses a service-account key: a self-signed RS256 JWT is
//! exchanged for a short-lived access token, which is cached until shortly
//! before it expires.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use tracing::debug;

use crate::error::SyncError;

const SHEETS_API_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SHEETS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Refresh the access token this long before it actually expires
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Anything that can hand back the rows of a named tab
pub trait SheetSource {
    /// Rows in sheet order; each row is its cells as strings, left to right
    fn fetch_rows(&self, spreadsheet_id: &str, sheet: &str) -> Result<Vec<Vec<String>>, SyncError>;
}

/// The fields of a service-account key file we need
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = fs::read_to_string(path).map_err(|e| {
            SyncError::Auth(format!(
                "cannot read credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            SyncError::Auth(format!(
                "credentials file {} is not a service-account key: {}",
                path.display(),
                e
            ))
        })
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Build the signed assertion sent to the token endpoint
fn build_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String, SyncError> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    let claims = Claims {
        iss: &key.client_email,
        scope: SHEETS_READONLY_SCOPE,
        aud: key.token_uri(),
        iat: now.timestamp(),
        exp: now.timestamp() + TOKEN_LIFETIME_SECS,
    };

    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| SyncError::Auth(format!("invalid service-account private key: {}", e)))?;
    encode(&header, &claims, &encoding_key)
        .map_err(|e| SyncError::Auth(format!("failed to sign token request: {}", e)))
}

/// Map a non-success response of the values endpoint onto the error taxonomy
pub fn classify_status(status: StatusCode, body: &str, what: &str) -> SyncError {
    let detail = format!("{} (HTTP {}): {}", what, status.as_u16(), body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(detail),
        StatusCode::NOT_FOUND => SyncError::NotFound(detail),
        // Unknown tab names come back as 400 rather than 404
        StatusCode::BAD_REQUEST if body.contains("Unable to parse range") => {
            SyncError::NotFound(detail)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SyncError::Transient(detail)
        }
        s if s.is_server_error() => SyncError::Transient(detail),
        _ => SyncError::InvalidResponse(detail),
    }
}

/// Map a response of the token endpoint onto the error taxonomy
fn classify_token_status(status: StatusCode, body: &str) -> SyncError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        SyncError::Transient(format!("token endpoint (HTTP {}): {}", status.as_u16(), body.trim()))
    } else {
        // invalid_grant, invalid_client, disabled key, clock skew...
        SyncError::Auth(format!("token request rejected (HTTP {}): {}", status.as_u16(), body.trim()))
    }
}

fn request_error(e: reqwest::Error, what: &str) -> SyncError {
    if e.is_decode() {
        SyncError::InvalidResponse(format!("{}: {}", what, e))
    } else {
        SyncError::Transient(format!("{}: {}", what, e))
    }
}

/// Stringify one cell of an UNFORMATTED_VALUE response
pub fn cell_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A1 range covering the whole tab; the name is quoted so spaces work
fn sheet_range(sheet: &str) -> String {
    format!("'{}'", sheet.replace('\'', "''"))
}

pub fn values_url(spreadsheet_id: &str, sheet: &str) -> String {
    format!(
        "{}/{}/values/{}?majorDimension=ROWS&valueRenderOption=UNFORMATTED_VALUE",
        SHEETS_API_URL,
        urlencoding::encode(spreadsheet_id),
        urlencoding::encode(&sheet_range(sheet))
    )
}

pub struct GoogleSheetsClient {
    client: reqwest::blocking::Client,
    credentials_path: PathBuf,
    key: RefCell<Option<ServiceAccountKey>>,
    token: RefCell<Option<AccessToken>>,
}

impl GoogleSheetsClient {
    /// The key file is read on first use, so a missing file surfaces as an
    /// auth failure of that cycle rather than at startup.
    pub fn new(credentials_path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("price-sync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(StdDuration::from_secs(15))
            .timeout(StdDuration::from_secs(60))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            credentials_path: credentials_path.into(),
            key: RefCell::new(None),
            token: RefCell::new(None),
        })
    }

    fn key(&self) -> Result<ServiceAccountKey, SyncError> {
        if let Some(key) = self.key.borrow().as_ref() {
            return Ok(key.clone());
        }
        let key = ServiceAccountKey::load(&self.credentials_path)?;
        debug!("Loaded service account {}", key.client_email);
        *self.key.borrow_mut() = Some(key.clone());
        Ok(key)
    }

    fn access_token(&self) -> Result<String, SyncError> {
        let now = Utc::now();
        if let Some(token) = self.token.borrow().as_ref() {
            if token.is_fresh(now) {
                return Ok(token.value.clone());
            }
        }

        let key = self.key()?;
        let assertion = build_assertion(&key, now)?;
        let response = self
            .client
            .post(key.token_uri())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .map_err(|e| request_error(e, "token request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            // A rejected key will not get better by itself; force a reload next time
            *self.key.borrow_mut() = None;
            return Err(classify_token_status(status, &body));
        }

        let token: TokenResponse = response
            .json()
            .map_err(|e| request_error(e, "failed to decode token response"))?;
        let lifetime = token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS);
        debug!("Obtained access token valid for {}s", lifetime);

        let value = token.access_token.clone();
        *self.token.borrow_mut() = Some(AccessToken {
            value: token.access_token,
            expires_at: now + Duration::seconds(lifetime),
        });
        Ok(value)
    }
}

impl SheetSource for GoogleSheetsClient {
    fn fetch_rows(&self, spreadsheet_id: &str, sheet: &str) -> Result<Vec<Vec<String>>, SyncError> {
        let token = self.access_token()?;
        let url = values_url(spreadsheet_id, sheet);
        let what = format!("sheet '{}'", sheet);
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .map_err(|e| request_error(e, &what))?;

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                *self.token.borrow_mut() = None;
            }
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status, &body, &what));
        }

        let range: ValueRange = response.json().map_err(|e| request_error(e, &what))?;
        Ok(parse_rows(range))
    }
}

fn parse_rows(range: ValueRange) -> Vec<Vec<String>> {
    range
        .values
        .iter()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect()
}
