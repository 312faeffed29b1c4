// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Authenticated HTTP session with a Skuid NLX site.
//!
//! A __session__ is created by exchanging user credentials for a bearer token
//! at the host's token endpoint. The token lives for one command invocation
//! and is attached to every request issued through the session.
//!
//! # Failure Classes
//!
//! Requests fail in one of three broad ways, and callers branch on them:
//!
//! - __Transport__: TCP, TLS, DNS, or timeout failure. No response exists.
//! - __Server__: the host answered with a non-2xx status. The status and a
//!   snippet of the body are kept so callers can tell 401 from 4xx from 5xx.
//! - __Auth__: the token endpoint rejected the credentials.
//!
//! Idempotent requests are retried on transport failures and 5xx responses
//! according to a [`RetryPolicy`]. Everything else is attempted once.

pub mod retry;

pub use retry::RetryPolicy;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    multipart::{Form, Part},
    Client, Method, Url,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("skuid-sync/", env!("CARGO_PKG_VERSION"));

/// Content type of JSON request and response bodies.
pub const APPLICATION_JSON: &str = "application/json";

/// Content type of zip request and response bodies.
pub const APPLICATION_ZIP: &str = "application/zip";

const SNIPPET_LEN: usize = 512;

/// Absolute base URL of a site host.
///
/// # Invariant
///
/// - Always carries a scheme. Bare host names gain `https://` on ingress.
/// - Never ends with a slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostUrl(String);

impl HostUrl {
    /// Parse and normalize host.
    ///
    /// A bare host name like `example.skuidsite.com` becomes
    /// `https://example.skuidsite.com`. Credentials and tokens only ever
    /// travel over TLS, so an explicit `http://` scheme is refused.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::InvalidHost`] if host is empty, uses a scheme
    ///   other than HTTPS, or is not a valid URL.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
        Self::normalize(raw.as_ref(), false)
    }

    /// Parse and normalize host like [`HostUrl::parse`], but keep an explicit
    /// `http://` scheme. Meant for local servers only, and logged as a
    /// warning.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::InvalidHost`] if host is empty, uses a scheme
    ///   other than HTTP(S), or is not a valid URL.
    pub fn parse_insecure(raw: impl AsRef<str>) -> Result<Self> {
        Self::normalize(raw.as_ref(), true)
    }

    fn normalize(raw: &str, allow_http: bool) -> Result<Self> {
        let trimmed = raw.trim().trim_end_matches('/');
        let invalid = |reason: &'static str| SessionError::InvalidHost {
            host: raw.to_owned(),
            reason,
        };

        if trimmed.is_empty() {
            return Err(invalid("host is empty"));
        }

        let normalized = if trimmed.starts_with("https://") {
            trimmed.to_owned()
        } else if allow_http && trimmed.starts_with("http://") {
            warn!("host {trimmed} does not use TLS");
            trimmed.to_owned()
        } else if trimmed.contains("://") {
            return Err(invalid("scheme must be https"));
        } else {
            format!("https://{trimmed}")
        };

        let url = Url::parse(&normalized).map_err(|_| invalid("not a valid URL"))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host name"));
        }

        Ok(Self(normalized))
    }

    /// Treat host as string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Join path component onto host.
    pub fn join(&self, path: impl AsRef<str>) -> String {
        let path = path.as_ref();
        if path.starts_with('/') {
            format!("{}{path}", self.0)
        } else {
            format!("{}/{path}", self.0)
        }
    }
}

impl Display for HostUrl {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for HostUrl {
    type Err = SessionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

/// Bearer token plus the host that issued it.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    access_token: String,
    host: HostUrl,
}

impl AuthToken {
    /// Construct new token for host.
    pub fn new(access_token: impl Into<String>, host: HostUrl) -> Self {
        Self {
            access_token: access_token.into(),
            host,
        }
    }

    /// Effective host that issued the token.
    pub fn host(&self) -> &HostUrl {
        &self.host
    }

    /// Raw bearer token.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl Debug for AuthToken {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("AuthToken")
            .field("access_token", &"<redacted>")
            .field("host", &self.host)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Knobs for building a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    /// Time budget of a single request.
    pub request_timeout: Duration,

    /// Retry policy for idempotent requests.
    pub retry: RetryPolicy,

    /// Accept plain `http://` hosts.
    pub allow_http: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            allow_http: false,
        }
    }
}

/// Authenticated session.
///
/// Cheap to clone. The token is immutable for the lifetime of the session,
/// and no connection is reused across requests.
#[derive(Debug, Clone)]
pub struct Session {
    client: Client,
    token: AuthToken,
    retry: RetryPolicy,
}

impl Session {
    /// Authenticate against host with user credentials.
    ///
    /// Posts a password grant to `<host>/auth/token`, and keeps the access
    /// token of the response. Host normalization happens here.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::InvalidHost`] if host cannot be normalized.
    /// - Return [`SessionError::Auth`] if host rejects the credentials.
    /// - Return [`SessionError::Transport`] if host cannot be reached.
    /// - Return [`SessionError::Decode`] if token response is malformed.
    #[instrument(skip(password, options), level = "debug")]
    pub async fn authorize(
        host: &str,
        username: &str,
        password: &str,
        options: SessionOptions,
    ) -> Result<Self> {
        let host = if options.allow_http {
            HostUrl::parse_insecure(host)?
        } else {
            HostUrl::parse(host)?
        };
        let client = build_client(&options)?;
        info!("authenticate {username} at {host}");

        let response = client
            .post(host.join("/auth/token"))
            .form(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(SessionError::Auth {
                status: status.as_u16(),
                snippet: snippet(&body),
            });
        }

        let token: TokenResponse =
            serde_json::from_slice(&body).map_err(|source| SessionError::Decode {
                source,
                what: "token response",
            })?;
        debug!("obtained access token from {host}");

        Ok(Self {
            client,
            token: AuthToken::new(token.access_token, host),
            retry: options.retry,
        })
    }

    /// Construct session from token obtained elsewhere.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::Transport`] if HTTP client cannot be built.
    pub fn with_token(token: AuthToken, options: SessionOptions) -> Result<Self> {
        Ok(Self {
            client: build_client(&options)?,
            token,
            retry: options.retry,
        })
    }

    /// Host the session is bound to.
    pub fn host(&self) -> &HostUrl {
        self.token.host()
    }

    /// Token attached to requests.
    pub fn token(&self) -> &AuthToken {
        &self.token
    }

    /// Issue request and collect its response body.
    ///
    /// Adds `Authorization: Bearer <token>` unless the request carries its own
    /// authorization header. Idempotent requests are retried on transport
    /// failures and 5xx responses. The response body is read in full before
    /// returning, and handed to the caller.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::Server`] for non-2xx responses.
    /// - Return [`SessionError::Transport`] if host cannot be reached.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path), level = "debug")]
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let host = request.host.as_ref().unwrap_or(self.token.host());
        let url = host.join(&request.path);
        let retries = if self.retry.applies_to(&request.method) {
            self.retry.retries
        } else {
            0
        };

        let mut retry = 0;
        loop {
            match self.send_once(&url, &request).await {
                Err(error) if retry < retries && error.is_retryable() => {
                    let delay = self.retry.delay(retry);
                    warn!("{} {url} failed, retry in {delay:?}: {error}", request.method);
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                result => return result,
            }
        }
    }

    async fn send_once(&self, url: &str, request: &ApiRequest) -> Result<ApiResponse> {
        let mut builder = self.client.request(request.method.clone(), url);
        if !request.headers.contains_key(AUTHORIZATION) {
            builder = builder.bearer_auth(self.token.access_token());
        }
        builder = builder.headers(request.headers.clone());
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(bytes) => builder
                .header(CONTENT_TYPE, APPLICATION_JSON)
                .body(bytes.clone()),
            RequestBody::Zip(bytes) => builder
                .header(CONTENT_TYPE, APPLICATION_ZIP)
                .body(bytes.clone()),
            RequestBody::Multipart(parts) => builder.multipart(multipart_form(parts)?),
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        debug!("{} {url} -> {status} ({} bytes)", request.method, body.len());
        if !status.is_success() {
            return Err(SessionError::Server {
                status: status.as_u16(),
                snippet: snippet(&body),
            });
        }

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}

fn build_client(options: &SessionOptions) -> Result<Client> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .timeout(options.request_timeout)
        .pool_max_idle_per_host(0)
        .build()?)
}

fn multipart_form(parts: &[FormPart]) -> Result<Form> {
    let mut form = Form::new();
    for part in parts {
        let mut body = Part::bytes(part.bytes.clone()).mime_str(part.content_type)?;
        if let Some(file_name) = &part.file_name {
            body = body.file_name(file_name.clone());
        }
        form = form.part(part.name.clone(), body);
    }

    Ok(form)
}

/// Leading part of a response body fit for error messages.
fn snippet(body: &[u8]) -> String {
    let end = body.len().min(SNIPPET_LEN);
    String::from_utf8_lossy(&body[..end]).trim().to_owned()
}

/// Request issued through a [`Session`].
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    host: Option<HostUrl>,
    path: String,
    body: RequestBody,
    headers: HeaderMap,
}

impl ApiRequest {
    /// Construct new request against the session host.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            host: None,
            path: path.into(),
            body: RequestBody::Empty,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Send request to another host than the session host.
    pub fn host(mut self, host: Option<HostUrl>) -> Self {
        self.host = host;
        self
    }

    /// Attach JSON body.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::Encode`] if value cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.body = RequestBody::Json(serde_json::to_vec(value).map_err(SessionError::Encode)?);
        Ok(self)
    }

    /// Attach zip archive body.
    pub fn zip(mut self, archive: Vec<u8>) -> Self {
        self.body = RequestBody::Zip(archive);
        self
    }

    /// Attach multipart form body.
    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    /// Set header, replacing any previous value.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set accepted response content type.
    pub fn accept(self, content_type: &'static str) -> Self {
        self.header(ACCEPT, HeaderValue::from_static(content_type))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Body of an [`ApiRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    Json(Vec<u8>),
    Zip(Vec<u8>),
    Multipart(Vec<FormPart>),
}

/// Named field of a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub file_name: Option<String>,
}

/// Successful response of an [`ApiRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Decode body as JSON.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::Decode`] if body is not the expected JSON.
    pub fn json<T: DeserializeOwned>(&self, what: &'static str) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|source| SessionError::Decode { source, what })
    }
}

/// Session error types.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Host cannot be normalized into an absolute URL.
    #[error("invalid host {host:?}: {reason}")]
    InvalidHost { host: String, reason: &'static str },

    /// Token endpoint rejected the credentials.
    #[error("authentication failed with status {status}: {snippet}")]
    Auth { status: u16, snippet: String },

    /// Host cannot be reached, or the request timed out.
    #[error("transport failure")]
    Transport(#[from] reqwest::Error),

    /// Host answered with a non-2xx status.
    #[error("server responded with status {status}: {snippet}")]
    Server { status: u16, snippet: String },

    /// Response body is not what was expected.
    #[error("failed to decode {what}")]
    Decode {
        #[source]
        source: serde_json::Error,
        what: &'static str,
    },

    /// Request body cannot be serialized.
    #[error("failed to encode request body")]
    Encode(#[source] serde_json::Error),
}

impl SessionError {
    /// Failure may go away when the same request is sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Credentials were rejected, or the token is no longer valid.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Server { status: 401, .. })
    }
}

/// Friendly result alias :3
type Result<T, E = SessionError> = std::result::Result<T, E>;
