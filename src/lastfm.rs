use std::sync::Arc;

use reqwest::{Client, Error as ReqwestError, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ScrobblerConfig;
use crate::models::{ScrobbleResult, ScrobbleTrack};
use crate::retry::{RetryPolicy, Transient};
use crate::secrets::{SecretStore, SecretStoreError, StoredSession};

#[derive(Error, Debug)]
pub enum ScrobbleError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Session expired, sign in again")]
    SessionExpired,
    #[error("Rate limited by service")]
    RateLimited { retry_after: Option<u64> },
    #[error("Network error: {0}")]
    Network(#[from] ReqwestError),
    #[error("Service unavailable")]
    ServiceUnavailable,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Secret store error: {0}")]
    SecretStore(#[from] SecretStoreError),
}

impl Transient for ScrobbleError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ScrobbleError::Network(_)
                | ScrobbleError::RateLimited { .. }
                | ScrobbleError::ServiceUnavailable
        )
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ScrobbleError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Scrobble service operations the pipeline depends on (allows mocking for
/// tests).
#[async_trait::async_trait]
pub trait ScrobbleService: Send + Sync {
    /// Exchange account credentials for a session token. Does not persist
    /// anything; that is the session manager's job.
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<StoredSession, ScrobbleError>;

    /// Best-effort "listening now" signal, distinct from a scrobble.
    async fn update_now_playing(&self, track: &ScrobbleTrack) -> Result<(), ScrobbleError>;

    /// Submit a batch and return one verdict per input track, preserving
    /// order. An empty batch returns an empty result set without touching
    /// the network.
    async fn scrobble(&self, tracks: &[ScrobbleTrack])
        -> Result<Vec<ScrobbleResult>, ScrobbleError>;

    /// Whether the stored session is still honored by the service. `false`
    /// without a network call when no session is stored.
    async fn validate_session(&self) -> Result<bool, ScrobbleError>;
}

/// Audioscrobbler 2.0 protocol client.
///
/// Every call is a signed form POST against a single endpoint; responses are
/// JSON. Network operations run inside the retry policy, and anything that
/// needs a session checks the secret store before touching the network.
pub struct LastfmClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    secrets: Arc<dyn SecretStore>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LastfmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastfmClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LastfmClient {
    pub fn new(config: &ScrobblerConfig, secrets: Arc<dyn SecretStore>) -> Self {
        LastfmClient {
            client: Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            secrets,
            retry: RetryPolicy::new(config.retry.clone()),
        }
    }

    fn require_session(&self) -> Result<StoredSession, ScrobbleError> {
        match self.secrets.load_session()? {
            Some(session) => Ok(session),
            None => Err(ScrobbleError::SessionExpired),
        }
    }

    /// Sign the params, POST them, and decode the JSON body, mapping HTTP
    /// and API-level failures into the error taxonomy.
    async fn call(
        &self,
        mut params: Vec<(String, String)>,
    ) -> Result<serde_json::Value, ScrobbleError> {
        let api_sig = sign_params(&params, &self.api_secret);
        params.push(("api_sig".to_string(), api_sig));
        params.push(("format".to_string(), "json".to_string()));

        let response = self
            .client
            .post(&self.base_url)
            .form(&params)
            .send()
            .await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());
            return Err(ScrobbleError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(ScrobbleError::ServiceUnavailable);
        }

        // Client errors still carry a JSON body with the API error code.
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ScrobbleError::InvalidResponse(format!("undecodable body: {}", e)))?;

        if let Some(code) = body.get("error").and_then(serde_json::Value::as_u64) {
            let message = body
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(map_api_error(code, message));
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl ScrobbleService for LastfmClient {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<StoredSession, ScrobbleError> {
        info!("Requesting scrobble session for {}", username);

        let password_digest = format!("{:x}", md5::compute(password));
        let auth_token = format!(
            "{:x}",
            md5::compute(format!("{}{}", username, password_digest))
        );
        let params = vec![
            ("method".to_string(), "auth.getMobileSession".to_string()),
            ("username".to_string(), username.to_string()),
            ("authToken".to_string(), auth_token),
            ("api_key".to_string(), self.api_key.clone()),
        ];

        let body = self
            .retry
            .run("auth.getMobileSession", || self.call(params.clone()))
            .await?;
        let parsed: SessionResponseBody = serde_json::from_value(body).map_err(|e| {
            ScrobbleError::InvalidResponse(format!("missing session key: {}", e))
        })?;

        // The service echoes the canonical account name; prefer it.
        let username = parsed.session.name.unwrap_or_else(|| username.to_string());
        Ok(StoredSession {
            session_key: parsed.session.key,
            username,
        })
    }

    async fn update_now_playing(&self, track: &ScrobbleTrack) -> Result<(), ScrobbleError> {
        let session = self.require_session()?;
        debug!("Now playing: {} - {}", track.artist, track.title);

        let mut params = vec![
            ("method".to_string(), "track.updateNowPlaying".to_string()),
            ("artist".to_string(), track.artist.clone()),
            ("track".to_string(), track.title.clone()),
            ("api_key".to_string(), self.api_key.clone()),
            ("sk".to_string(), session.session_key.clone()),
        ];
        if let Some(album) = &track.album {
            params.push(("album".to_string(), album.clone()));
        }
        if let Some(duration) = track.duration_secs {
            params.push(("duration".to_string(), duration.to_string()));
        }

        self.retry
            .run("track.updateNowPlaying", || self.call(params.clone()))
            .await?;
        Ok(())
    }

    async fn scrobble(
        &self,
        tracks: &[ScrobbleTrack],
    ) -> Result<Vec<ScrobbleResult>, ScrobbleError> {
        if tracks.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.require_session()?;
        info!("Submitting {} scrobbles", tracks.len());

        let mut params = vec![
            ("method".to_string(), "track.scrobble".to_string()),
            ("api_key".to_string(), self.api_key.clone()),
            ("sk".to_string(), session.session_key.clone()),
        ];
        for (index, track) in tracks.iter().enumerate() {
            params.push((format!("artist[{}]", index), track.artist.clone()));
            params.push((format!("track[{}]", index), track.title.clone()));
            params.push((format!("timestamp[{}]", index), track.timestamp.to_string()));
            if let Some(album) = &track.album {
                params.push((format!("album[{}]", index), album.clone()));
            }
            if let Some(duration) = track.duration_secs {
                params.push((format!("duration[{}]", index), duration.to_string()));
            }
        }

        let body = self
            .retry
            .run("track.scrobble", || self.call(params.clone()))
            .await?;
        parse_scrobble_response(tracks, body)
    }

    async fn validate_session(&self) -> Result<bool, ScrobbleError> {
        let session = match self.secrets.load_session()? {
            Some(session) => session,
            None => return Ok(false),
        };

        let params = vec![
            ("method".to_string(), "user.getInfo".to_string()),
            ("user".to_string(), session.username.clone()),
            ("api_key".to_string(), self.api_key.clone()),
            ("sk".to_string(), session.session_key.clone()),
        ];
        match self.retry.run("user.getInfo", || self.call(params.clone())).await {
            Ok(_) => Ok(true),
            Err(ScrobbleError::SessionExpired | ScrobbleError::InvalidCredentials) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// api_sig: md5 over the params sorted by key, concatenated as key+value,
/// with the shared secret appended. `format` and `api_sig` itself stay out.
fn sign_params(params: &[(String, String)], secret: &str) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut payload = String::new();
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }
    payload.push_str(secret);
    format!("{:x}", md5::compute(payload))
}

fn map_api_error(code: u64, message: String) -> ScrobbleError {
    match code {
        // 4: authentication failed, 10: invalid API key, 26: key suspended
        4 | 10 | 26 => ScrobbleError::InvalidCredentials,
        // 9: invalid session key
        9 => ScrobbleError::SessionExpired,
        // 11: service offline, 16: temporarily unavailable
        11 | 16 => ScrobbleError::ServiceUnavailable,
        // 29: rate limit exceeded
        29 => ScrobbleError::RateLimited { retry_after: None },
        _ => ScrobbleError::InvalidResponse(format!("API error {}: {}", code, message)),
    }
}

fn parse_scrobble_response(
    tracks: &[ScrobbleTrack],
    body: serde_json::Value,
) -> Result<Vec<ScrobbleResult>, ScrobbleError> {
    let parsed: ScrobbleResponseBody = serde_json::from_value(body).map_err(|e| {
        ScrobbleError::InvalidResponse(format!("undecodable scrobble response: {}", e))
    })?;

    let entries = match parsed.scrobbles.entries {
        ScrobbleEntries::One(entry) => vec![*entry],
        ScrobbleEntries::Many(entries) => entries,
    };
    if entries.len() != tracks.len() {
        return Err(ScrobbleError::InvalidResponse(format!(
            "{} verdicts for {} submitted tracks",
            entries.len(),
            tracks.len()
        )));
    }

    Ok(tracks
        .iter()
        .zip(entries.iter())
        .map(|(track, entry)| entry.to_result(track))
        .collect())
}

#[derive(Debug, Deserialize)]
struct SessionResponseBody {
    session: SessionBody,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    key: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrobbleResponseBody {
    scrobbles: ScrobblesBody,
}

#[derive(Debug, Deserialize)]
struct ScrobblesBody {
    // A single-track submit comes back as a bare object, a batch as an
    // array.
    #[serde(rename = "scrobble")]
    entries: ScrobbleEntries,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScrobbleEntries {
    One(Box<ScrobbleEntryBody>),
    Many(Vec<ScrobbleEntryBody>),
}

#[derive(Debug, Deserialize)]
struct ScrobbleEntryBody {
    #[serde(default)]
    artist: Option<CorrectableField>,
    #[serde(default)]
    track: Option<CorrectableField>,
    #[serde(rename = "ignoredMessage")]
    #[serde(default)]
    ignored_message: Option<IgnoredMessageBody>,
}

impl ScrobbleEntryBody {
    fn to_result(&self, track: &ScrobbleTrack) -> ScrobbleResult {
        let ignored_reason = self
            .ignored_message
            .as_ref()
            .and_then(IgnoredMessageBody::reason);
        ScrobbleResult {
            track_id: track.id.clone(),
            accepted: ignored_reason.is_none(),
            corrected_artist: self.artist.as_ref().and_then(CorrectableField::correction),
            corrected_title: self.track.as_ref().and_then(CorrectableField::correction),
            ignored_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CorrectableField {
    #[serde(default)]
    corrected: Option<FlexibleCode>,
    #[serde(rename = "#text")]
    #[serde(default)]
    text: Option<String>,
}

impl CorrectableField {
    /// The service-corrected value, when the correction flag is set.
    fn correction(&self) -> Option<String> {
        let flagged = self
            .corrected
            .as_ref()
            .is_some_and(|flag| flag.value() == "1");
        if flagged {
            self.text.clone().filter(|text| !text.is_empty())
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct IgnoredMessageBody {
    #[serde(default)]
    code: Option<FlexibleCode>,
    #[serde(rename = "#text")]
    #[serde(default)]
    text: Option<String>,
}

impl IgnoredMessageBody {
    /// Why the scrobble was ignored; `None` when it was accepted (code 0).
    fn reason(&self) -> Option<String> {
        let code = self
            .code
            .as_ref()
            .map(FlexibleCode::value)
            .unwrap_or_else(|| "0".to_string());
        if code == "0" {
            return None;
        }
        match self.text.as_deref().filter(|text| !text.is_empty()) {
            Some(text) => Some(text.to_string()),
            None => Some(describe_ignored_code(&code).to_string()),
        }
    }
}

/// Ignored-scrobble codes from the scrobble response.
fn describe_ignored_code(code: &str) -> &'static str {
    match code {
        "1" => "artist was ignored",
        "2" => "track was ignored",
        "3" => "timestamp too old",
        "4" => "timestamp too new",
        "5" => "daily scrobble limit exceeded",
        _ => "scrobble rejected",
    }
}

/// The service emits some attributes as strings and some as numbers
/// depending on the serializer in front of the endpoint.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FlexibleCode {
    Text(String),
    Number(u64),
}

impl FlexibleCode {
    fn value(&self) -> String {
        match self {
            FlexibleCode::Text(text) => text.clone(),
            FlexibleCode::Number(number) => number.to_string(),
        }
    }
}
