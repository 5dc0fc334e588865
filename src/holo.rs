use std::fmt;
use std::path::Path;
use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::client::{AuthenticatedClient, ClientError, FormPart, PendingRequest};

/// Characters left as-is by `encodeURIComponent`.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    Public,
    Friends,
    #[serde(rename = "self")]
    #[value(name = "self")]
    SelfOnly,
    #[default]
    Draft,
}

impl PublishMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishMode::Public => "public",
            PublishMode::Friends => "friends",
            PublishMode::SelfOnly => "self",
            PublishMode::Draft => "draft",
        }
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RemoteConfig {
    /// The backend-advertised base URL, when it is set and parses.
    pub fn base_url(&self) -> Option<Url> {
        let raw = self.api_base_url.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        Url::parse(raw).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub open_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub avatar_large_url: Option<String>,
    #[serde(default)]
    pub profile_deep_link: Option<String>,
    #[serde(default)]
    pub follower_count: Option<i64>,
    #[serde(default)]
    pub following_count: Option<i64>,
    #[serde(default)]
    pub likes_count: Option<i64>,
    #[serde(default)]
    pub video_count: Option<i64>,
}

impl UserInfo {
    pub fn avatar(&self) -> Option<&str> {
        self.avatar_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.avatar_large_url.as_deref())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Video {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub video_description: Option<String>,
    #[serde(default)]
    pub cover_image_url: Option<String>,
    #[serde(default)]
    pub share_url: Option<String>,
    #[serde(default)]
    pub embed_link: Option<String>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub comment_count: Option<i64>,
    #[serde(default)]
    pub share_count: Option<i64>,
    #[serde(default)]
    pub view_count: Option<i64>,
}

impl Video {
    pub fn display_title(&self) -> &str {
        [&self.title, &self.video_description]
            .into_iter()
            .filter_map(|s| s.as_deref())
            .find(|s| !s.is_empty())
            .unwrap_or("(untitled)")
    }

    pub fn link(&self) -> Option<&str> {
        [&self.share_url, &self.embed_link]
            .into_iter()
            .filter_map(|s| s.as_deref())
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoPage {
    pub videos: Vec<Video>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

impl VideoPage {
    /// The cursor to request the next page with, if there is one.
    pub fn next_cursor(&self) -> Option<&str> {
        if self.has_more {
            self.cursor.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentJob {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub publish_mode: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobAccepted {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub job: Option<ContentJob>,
}

impl JobAccepted {
    pub fn job_id(&self) -> Option<&str> {
        self.job.as_ref().and_then(|job| job.id.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOutcome {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub privacy: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub published_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: PublishOutcome,
}

/// Typed access to the holo backend routes.
pub struct Client {
    http: Arc<AuthenticatedClient>,
}

impl Client {
    pub fn new(http: Arc<AuthenticatedClient>) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &AuthenticatedClient {
        &self.http
    }

    pub fn remote_config(&self) -> Result<RemoteConfig, ClientError> {
        self.http
            .execute_json(&PendingRequest::get("/config").skip_auth())
    }

    /// Fetches `/config` and switches the base URL when it advertises one.
    pub fn apply_remote_config(&self) -> Result<RemoteConfig, ClientError> {
        let remote = self.remote_config()?;
        if let Some(url) = remote.base_url() {
            self.http.set_base_url(url);
        }
        Ok(remote)
    }

    pub fn login_url(&self) -> Result<Url, ClientError> {
        self.http.resolve("/auth/login", &[])
    }

    /// Notifies the backend of a logout. The backend keeps no session state,
    /// so failures are only logged.
    pub fn logout(&self) {
        let req = PendingRequest::post("/auth/logout").skip_auth();
        if let Err(err) = self.http.execute(&req) {
            debug!(error = %err, "logout notification failed");
        }
    }

    pub fn me(&self) -> Result<UserInfo, ClientError> {
        let payload = self.http.execute(&PendingRequest::get("/api/me"))?;
        user_from_payload(payload.into_json())
    }

    pub fn list_videos(
        &self,
        max_count: u32,
        cursor: Option<&str>,
    ) -> Result<VideoPage, ClientError> {
        let mut body = json!({ "max_count": max_count });
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            body["cursor"] = Value::String(cursor.to_string());
        }
        let payload = self
            .http
            .execute(&PendingRequest::post("/api/videos").json(body))?;
        page_from_payload(payload.into_json())
    }

    pub fn query_videos(&self, video_ids: &[String]) -> Result<Value, ClientError> {
        if video_ids.is_empty() {
            return Err(ClientError::Body("at least one video id is required".into()));
        }
        let req = PendingRequest::post("/api/videos/query").json(json!({ "video_ids": video_ids }));
        Ok(self.http.execute(&req)?.into_json())
    }

    pub fn display_profile(&self) -> Result<UserInfo, ClientError> {
        let payload = self.http.execute(&PendingRequest::get("/display/profile"))?;
        user_from_payload(payload.into_json())
    }

    pub fn display_debug(&self) -> Result<Value, ClientError> {
        let token = self.http.credentials().access_token().unwrap_or_default();
        let req = PendingRequest::get("/display/debug").query("token", token);
        Ok(self.http.execute(&req)?.into_json())
    }

    pub fn content_debug(&self) -> Result<Value, ClientError> {
        Ok(self
            .http
            .execute(&PendingRequest::get("/content/debug"))?
            .into_json())
    }

    pub fn creator_info(&self) -> Result<Value, ClientError> {
        let mut req = PendingRequest::get("/content/creator-info");
        if let Some(token) = self.http.credentials().access_token() {
            req = req.query("access_token", token);
        }
        Ok(self.http.execute(&req)?.into_json())
    }

    pub fn client_token(&self) -> Result<Value, ClientError> {
        let req = PendingRequest::post("/auth/client-token").json(json!({}));
        Ok(self.http.execute(&req)?.into_json())
    }

    pub fn upload_file(&self, path: &Path, mode: PublishMode) -> Result<JobAccepted, ClientError> {
        let bytes = std::fs::read(path)
            .map_err(|err| ClientError::Body(format!("read {}: {}", path.display(), err)))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        let mime = tree_magic_mini::from_u8(&bytes).to_string();
        debug!(file = %file_name, size = bytes.len(), %mime, "uploading file");

        let parts = vec![
            FormPart::File {
                name: "file".into(),
                file_name,
                mime,
                bytes,
            },
            FormPart::text("publish_mode", mode.as_str()),
        ];
        self.http
            .execute_json(&PendingRequest::post("/content/upload/file").multipart(parts))
    }

    pub fn upload_url(&self, source_url: &str, mode: PublishMode) -> Result<JobAccepted, ClientError> {
        let source_url = source_url.trim();
        if source_url.is_empty() {
            return Err(ClientError::Body("source url is required".into()));
        }
        let parts = vec![
            FormPart::text("source_url", source_url),
            FormPart::text("publish_mode", mode.as_str()),
        ];
        self.http
            .execute_json(&PendingRequest::post("/content/upload/url").multipart(parts))
    }

    pub fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, ClientError> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(ClientError::Body("job id is required".into()));
        }
        let path = format!(
            "/content/status/{}",
            utf8_percent_encode(job_id, PATH_SEGMENT)
        );
        self.http.execute_json(&PendingRequest::get(path))
    }

    pub fn publish(
        &self,
        job_id: &str,
        privacy: PublishMode,
        caption: Option<&str>,
    ) -> Result<PublishResponse, ClientError> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(ClientError::Body("job id is required".into()));
        }
        let mut parts = vec![
            FormPart::text("job_id", job_id),
            FormPart::text("privacy", privacy.as_str()),
        ];
        if let Some(caption) = caption.map(str::trim).filter(|c| !c.is_empty()) {
            parts.push(FormPart::text("caption", caption));
        }
        self.http
            .execute_json(&PendingRequest::post("/content/publish").multipart(parts))
    }
}

/// Splits newline-separated ids, dropping blanks.
pub fn parse_video_ids(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn object_field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key).filter(|v| v.is_object())
}

fn user_from_payload(value: Value) -> Result<UserInfo, ClientError> {
    let data = object_field(&value, "data").unwrap_or(&value);
    let user = object_field(data, "user").unwrap_or(data);
    if !user.is_object() {
        return Ok(UserInfo::default());
    }
    serde_json::from_value(user.clone()).map_err(ClientError::Decode)
}

fn page_from_payload(value: Value) -> Result<VideoPage, ClientError> {
    let data = object_field(&value, "data").unwrap_or(&value);
    let videos = match data.get("videos").or_else(|| data.get("list")) {
        Some(list) if list.is_array() => {
            serde_json::from_value(list.clone()).map_err(ClientError::Decode)?
        }
        _ => Vec::new(),
    };
    let has_more = data.get("has_more").is_some_and(truthy);
    let cursor = [data.get("cursor"), data.get("cursor_next"), value.get("cursor_next")]
        .into_iter()
        .flatten()
        .find_map(cursor_value);

    Ok(VideoPage {
        videos,
        cursor,
        has_more,
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn cursor_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}
