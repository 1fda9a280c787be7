use crate::config::{EnvConfig, DEFAULT_TIMEOUT_SECS};
use crate::models::{Note, NoteId, Tags, Version};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::time::Duration;

pub(crate) const VERIFY_PATH: &str = "/-/verify";
const NOTES_PATH: &str = "/-/notes";
const NOTE_PATH: &str = "/-/note";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// 403: the credential is no longer valid.
    Unauthorized,
    /// 409: the version sent with a write is stale.
    Conflict,
    NotFound,
    /// Connection failure or timeout.
    Network,
    Http,
    Parse,
    /// No credential available for a request that needs one.
    MissingToken,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub(crate) fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn network(e: reqwest::Error) -> Self {
        let message = if e.is_timeout() {
            format!("Request timed out: {e}")
        } else {
            e.to_string()
        };
        Self::new(ApiErrorKind::Network, message)
    }

    fn parse(e: impl std::fmt::Display) -> Self {
        Self::new(ApiErrorKind::Parse, e.to_string())
    }

    pub(crate) fn unauthorized() -> Self {
        Self::new(ApiErrorKind::Unauthorized, "Unauthorized")
    }

    fn missing_token() -> Self {
        Self::new(ApiErrorKind::MissingToken, "No auth token")
    }

    /// Maps a non-2xx response. `body` is the raw response text, which may
    /// carry `{"error": "..."}`.
    fn from_status(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .map(str::to_string)
                    .unwrap_or_else(|| status.to_string())
            });

        let kind = match status {
            StatusCode::FORBIDDEN => ApiErrorKind::Unauthorized,
            StatusCode::CONFLICT => ApiErrorKind::Conflict,
            StatusCode::NOT_FOUND => ApiErrorKind::NotFound,
            _ => ApiErrorKind::Http,
        };
        Self::new(kind, message)
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ApiErrorKind::Conflict
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == ApiErrorKind::Unauthorized
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreateNoteRequest {
    pub title: String,
    pub body: String,
    pub tags: Tags,
}

impl CreateNoteRequest {
    pub fn empty() -> Self {
        Self {
            title: String::new(),
            body: String::new(),
            tags: Tags::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreatedNote {
    pub id: NoteId,
    pub version: Version,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UpdateNoteRequest {
    /// Version the client believes is current.
    pub version: Version,
    pub title: String,
    pub body: String,
    pub tags: Tags,
}

#[derive(Serialize, Clone, Debug)]
struct DeleteNoteRequest<'a> {
    version: &'a Version,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct VersionResponse {
    version: Version,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct VerifyResponse {
    #[serde(default)]
    version: String,
}

/// The remote note service as seen by the session.
///
/// Every call may suspend; all of them share one timeout policy and the same
/// error taxonomy ([`ApiErrorKind`]).
#[async_trait(?Send)]
pub trait NoteService {
    /// Installs (or clears) the bearer credential used for later requests.
    fn set_token(&self, token: Option<String>);

    /// Returns the server build version.
    async fn verify(&self) -> ApiResult<String>;

    async fn list_notes(&self) -> ApiResult<Vec<Note>>;

    async fn fetch_note(&self, id: NoteId) -> ApiResult<Note>;

    async fn create_note(&self, req: &CreateNoteRequest) -> ApiResult<CreatedNote>;

    /// Returns the fresh version on success, `Conflict` if `req.version` is stale.
    async fn update_note(&self, id: NoteId, req: &UpdateNoteRequest) -> ApiResult<Version>;

    async fn delete_note(&self, id: NoteId, version: &Version) -> ApiResult<()>;
}

/// HTTP/JSON implementation of [`NoteService`].
pub struct ApiClient {
    pub(crate) base_url: String,
    http: reqwest::Client,
    token: RefCell<Option<String>>,
}

impl ApiClient {
    /// Client for `base_url` with the default request timeout.
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn from_config(config: &EnvConfig) -> ApiResult<Self> {
        Self::with_timeout(config.api_url.as_str(), config.request_timeout)
    }

    /// Every request made through this client gives up after `timeout`.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::network)?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            token: RefCell::new(None),
        })
    }

    pub(crate) fn get_auth_token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.borrow().is_some()
    }

    fn with_auth_headers(
        mut req: reqwest::RequestBuilder,
        token: Option<String>,
    ) -> reqwest::RequestBuilder {
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + ?Sized)>,
    ) -> ApiResult<T> {
        let token = self.get_auth_token();
        if token.is_none() && path != VERIFY_PATH {
            return Err(ApiError::missing_token());
        }

        let url = format!("{}{}", self.base_url, path);
        log::debug!("{method} {path}");

        let mut req = self.http.request(method, url);
        req = Self::with_auth_headers(req, token);

        if let Some(b) = body {
            req = req.json(b);
        }

        let res = req.send().await.map_err(ApiError::network)?;
        let status = res.status();

        if status == StatusCode::FORBIDDEN {
            // Any 403 invalidates the credential, whichever call hit it.
            self.token.replace(None);
            log::warn!("{path}: credential rejected");
            return Err(ApiError::unauthorized());
        }

        let text = res.text().await.map_err(ApiError::network)?;

        if !status.is_success() {
            let err = ApiError::from_status(status, &text);
            log::warn!("{path} failed ({status}): {err}");
            return Err(err);
        }

        // 204 and other empty bodies decode as `null`.
        let text = if text.trim().is_empty() { "null" } else { &text };
        serde_json::from_str(text).map_err(ApiError::parse)
    }
}

#[async_trait(?Send)]
impl NoteService for ApiClient {
    fn set_token(&self, token: Option<String>) {
        self.token.replace(token);
    }

    async fn verify(&self) -> ApiResult<String> {
        let resp: VerifyResponse = self.request(Method::GET, VERIFY_PATH, None::<&()>).await?;
        Ok(resp.version)
    }

    async fn list_notes(&self) -> ApiResult<Vec<Note>> {
        let notes: Option<Vec<Note>> = self.request(Method::GET, NOTES_PATH, None::<&()>).await?;
        Ok(notes.unwrap_or_default())
    }

    async fn fetch_note(&self, id: NoteId) -> ApiResult<Note> {
        let mut note: Note = self
            .request(Method::GET, &format!("{NOTE_PATH}/{id}"), None::<&()>)
            .await?;
        // A full fetch always carries a body, even when the server omits an empty one.
        note.body.get_or_insert_with(String::new);
        Ok(note)
    }

    async fn create_note(&self, req: &CreateNoteRequest) -> ApiResult<CreatedNote> {
        self.request(Method::POST, NOTE_PATH, Some(req)).await
    }

    async fn update_note(&self, id: NoteId, req: &UpdateNoteRequest) -> ApiResult<Version> {
        let resp: VersionResponse = self
            .request(Method::PUT, &format!("{NOTE_PATH}/{id}"), Some(req))
            .await?;
        Ok(resp.version)
    }

    async fn delete_note(&self, id: NoteId, version: &Version) -> ApiResult<()> {
        let _: serde_json::Value = self
            .request(
                Method::DELETE,
                &format!("{NOTE_PATH}/{id}"),
                Some(&DeleteNoteRequest { version }),
            )
            .await?;
        Ok(())
    }
}
