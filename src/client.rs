//! Bearer-authenticated requests against the holo backend.
//!
//! Every call goes through [`AuthenticatedClient::execute`]. A 401 on the
//! first attempt triggers one refresh through `/auth/refresh` and one retry of
//! the original request; a failed refresh clears the stored credentials.

use std::time::Duration;

use anyhow::{bail, Context};
use parking_lot::RwLock;
use reqwest::blocking::{multipart, Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::storage::{CredentialStore, TokenUpdate};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8100/";
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Query parameters whose values never appear in errors or logs.
const SECRET_PARAMS: [&str; 3] = ["token", "access_token", "refresh_token"];

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request to {url} failed")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unauthorized")]
    Unauthorized,
    #[error("{message}")]
    RequestFailed { status: StatusCode, message: String },
    #[error("invalid url {url:?}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request body: {0}")]
    Body(String),
    #[error("decode response")]
    Decode(#[source] serde_json::Error),
    #[error("credential store: {0:#}")]
    Storage(anyhow::Error),
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            ClientError::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A successful response body: JSON when it parses, raw text otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn into_json(self) -> Value {
        match self {
            Payload::Json(value) => value,
            Payload::Text(text) => Value::String(text),
        }
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        serde_json::from_value(self.into_json()).map_err(ClientError::Decode)
    }
}

#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    Multipart(Vec<FormPart>),
}

/// One multipart field. File contents are held in memory so a retried
/// request sends the same bytes.
#[derive(Debug, Clone)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: String,
        bytes: Vec<u8>,
    },
}

impl FormPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        FormPart::Text {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl Body {
    fn apply(&self, builder: RequestBuilder) -> Result<RequestBuilder, ClientError> {
        Ok(match self {
            Body::Empty => builder,
            Body::Json(value) => builder.json(value),
            Body::Multipart(parts) => builder.multipart(multipart_form(parts)?),
        })
    }
}

fn multipart_form(parts: &[FormPart]) -> Result<multipart::Form, ClientError> {
    let mut form = multipart::Form::new();
    for part in parts {
        form = match part {
            FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
            FormPart::File {
                name,
                file_name,
                mime,
                bytes,
            } => {
                let file = multipart::Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(mime)
                    .map_err(|err| ClientError::Body(format!("mime {mime:?}: {err}")))?;
                form.part(name.clone(), file)
            }
        };
    }
    Ok(form)
}

/// A request description that can be sent more than once.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub url: String,
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub body: Body,
    pub skip_auth: bool,
}

impl PendingRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            query: Vec::new(),
            body: Body::Empty,
            skip_auth: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = Body::Multipart(parts);
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    Retried,
}

pub struct AuthenticatedClient {
    http: HttpClient,
    credentials: CredentialStore,
    user_agent: String,
    base_url: RwLock<Url>,
}

impl AuthenticatedClient {
    pub fn new(credentials: CredentialStore, config: ClientConfig) -> anyhow::Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("holo client user agent required");
        }
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base).with_context(|| format!("parse base url {base:?}"))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()
                .context("build http client")?,
        };

        Ok(Self {
            http,
            credentials,
            user_agent: config.user_agent,
            base_url: RwLock::new(base_url),
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn base_url(&self) -> Url {
        self.base_url.read().clone()
    }

    pub fn set_base_url(&self, url: Url) {
        debug!(%url, "base url updated");
        *self.base_url.write() = url;
    }

    /// Resolves `path` against the base URL; absolute http(s) URLs pass
    /// through unchanged.
    pub fn resolve(&self, path: &str, query: &[(String, String)]) -> Result<Url, ClientError> {
        let parsed = if is_absolute(path) {
            Url::parse(path)
        } else {
            self.base_url.read().join(path)
        };
        let mut url = parsed.map_err(|source| ClientError::InvalidUrl {
            url: path.to_string(),
            source,
        })?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    pub fn execute(&self, request: &PendingRequest) -> Result<Payload, ClientError> {
        let url = self.resolve(&request.url, &request.query)?;
        let mut attempt = Attempt::Initial;
        loop {
            let resp = self.send(request, &url)?;
            let status = resp.status();
            if status.is_success() {
                return read_payload(resp, &url);
            }
            if status == StatusCode::UNAUTHORIZED && attempt == Attempt::Initial {
                self.refresh_credentials()?;
                attempt = Attempt::Retried;
                debug!(method = %request.method, url = %redacted(&url), "retrying after refresh");
                continue;
            }
            return Err(failure(&request.method, &url, resp));
        }
    }

    pub fn execute_json<T: DeserializeOwned>(
        &self,
        request: &PendingRequest,
    ) -> Result<T, ClientError> {
        self.execute(request)?.decode()
    }

    fn send(&self, request: &PendingRequest, url: &Url) -> Result<Response, ClientError> {
        let mut req = self
            .http
            .request(request.method.clone(), url.clone())
            .header(USER_AGENT, self.user_agent.clone());
        if !request.skip_auth {
            if let Some(token) = self.credentials.access_token() {
                req = req.header(AUTHORIZATION, format!("Bearer {}", token));
            }
        }
        req = request.body.apply(req)?;

        debug!(method = %request.method, url = %redacted(url), "sending request");
        req.send().map_err(|source| network(url, source))
    }

    fn refresh_credentials(&self) -> Result<(), ClientError> {
        let Some(refresh_token) = self.credentials.refresh_token() else {
            warn!("unauthorized without a refresh token, clearing credentials");
            self.clear_credentials();
            return Err(ClientError::Unauthorized);
        };

        match self.request_refresh(&refresh_token) {
            Ok(update) => {
                if update.access_token.is_none() {
                    warn!("refresh response carried no access token, retrying with the stored one");
                }
                self.credentials
                    .set_tokens(&update)
                    .map_err(ClientError::Storage)?;
                info!(
                    rotated = update.refresh_token.as_deref() != Some(refresh_token.as_str()),
                    "access token refreshed"
                );
                Ok(())
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "token refresh failed, clearing credentials");
                self.clear_credentials();
                Err(ClientError::Unauthorized)
            }
        }
    }

    fn request_refresh(&self, refresh_token: &str) -> anyhow::Result<TokenUpdate> {
        let url = self.resolve(REFRESH_PATH, &[])?;
        let resp = self
            .http
            .post(url)
            .header(USER_AGENT, self.user_agent.clone())
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .context("refresh request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            bail!("refresh failed with {}: {}", status, body);
        }
        let payload: RefreshResponse = resp.json().context("decode refresh response")?;
        Ok(payload.into_update(refresh_token))
    }

    fn clear_credentials(&self) {
        if let Err(err) = self.credentials.clear() {
            warn!(error = %format!("{err:#}"), "clear credentials failed");
        }
    }
}

fn is_absolute(path: &str) -> bool {
    let lower = path.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// The URL as shown in errors and logs, with secret query values masked.
pub fn redacted(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| SECRET_PARAMS.contains(&k.as_ref())) {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if SECRET_PARAMS.contains(&k.as_ref()) {
                "***".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    let mut shown = url.clone();
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}

fn network(url: &Url, source: reqwest::Error) -> ClientError {
    ClientError::Network {
        url: redacted(url),
        source: source.without_url(),
    }
}

fn read_payload(resp: Response, url: &Url) -> Result<Payload, ClientError> {
    let is_json = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);
    let text = resp.text().map_err(|source| network(url, source))?;
    if is_json {
        return serde_json::from_str(&text)
            .map(Payload::Json)
            .map_err(ClientError::Decode);
    }
    Ok(match serde_json::from_str::<Value>(&text) {
        Ok(value) => Payload::Json(value),
        Err(_) => Payload::Text(text),
    })
}

fn failure(method: &Method, url: &Url, resp: Response) -> ClientError {
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    let message = if body.is_empty() {
        format!("{} {} failed with {}", method, redacted(url), status.as_u16())
    } else {
        body
    };
    ClientError::RequestFailed { status, message }
}

#[derive(Debug, Default, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    open_id: Option<String>,
    #[serde(default)]
    data: Option<RefreshData>,
}

#[derive(Debug, Default, Deserialize)]
struct RefreshData {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    open_id: Option<String>,
    #[serde(default)]
    user: Option<RefreshUser>,
}

#[derive(Debug, Default, Deserialize)]
struct RefreshUser {
    #[serde(default)]
    open_id: Option<String>,
}

impl RefreshResponse {
    fn into_update(self, previous_refresh: &str) -> TokenUpdate {
        let data = self.data.unwrap_or_default();
        let user = data.user.unwrap_or_default();

        let access_token = non_empty(self.access_token).or(non_empty(data.access_token));
        let refresh_token = non_empty(self.refresh_token)
            .or(non_empty(data.refresh_token))
            .unwrap_or_else(|| previous_refresh.to_string());
        let subject_id = non_empty(self.open_id)
            .or(non_empty(data.open_id))
            .or(non_empty(user.open_id));

        TokenUpdate {
            access_token,
            refresh_token: Some(refresh_token),
            subject_id,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
