//! Spotify Web API client for track search.
//!
//! Authenticates with the client-credentials grant and keeps the bearer
//! token until shortly before it expires. One client is built at startup and
//! handed to the caller; nothing here is global.
//!
//! Throttling (429), server errors (5xx) and dropped connections are retried
//! here, waiting as long as `Retry-After` asks, so a burst of rate limiting
//! does not end up recorded as a run of "not found" rows.

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use std::cell::RefCell;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::lookup::{LookupError, TrackSearch};
use crate::models::TrackMetadata;

const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
const API_BASE: &str = "https://api.spotify.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Refresh this long before the server-side expiry.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// How transient search failures are retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff for 5xx and connection errors, doubled on each retry.
    pub backoff: Duration,
    /// Longest `Retry-After` honoured; a longer one fails the lookup.
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(300),
            max_wait: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(retry))
    }
}

pub struct SpotifyClient {
    client: Client,
    credentials: Credentials,
    token_url: String,
    search_url: String,
    retry: RetryPolicy,
    token: RefCell<Option<AccessToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct SearchResponse {
    tracks: Option<TrackPage>,
}

#[derive(Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<TrackItem>,
}

#[derive(Deserialize)]
struct TrackItem {
    external_urls: ExternalUrls,
    album: AlbumItem,
    duration_ms: i64,
    popularity: i64,
    preview_url: Option<String>,
}

#[derive(Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

#[derive(Deserialize)]
struct AlbumItem {
    name: Option<String>,
    release_date: Option<String>,
}

impl From<TrackItem> for TrackMetadata {
    fn from(track: TrackItem) -> Self {
        TrackMetadata {
            spotify_url: track.external_urls.spotify,
            album_name: track.album.name,
            album_release_date: track.album.release_date,
            duration_ms: Some(track.duration_ms),
            popularity: Some(track.popularity),
            preview_url: track.preview_url,
        }
    }
}

fn transport(e: reqwest::Error) -> LookupError {
    if e.is_decode() {
        LookupError::Decode(e.to_string())
    } else {
        LookupError::Transport(e.to_string())
    }
}

fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Outcome of a single search request.
enum Attempt {
    Done(Option<TrackMetadata>),
    Unauthorized,
    Retry { error: LookupError, wait: Option<Duration> },
    Fail(LookupError),
}

impl SpotifyClient {
    pub fn new(credentials: Credentials) -> Result<Self, LookupError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(transport)?;

        Ok(Self {
            client,
            credentials,
            token_url: format!("{}/api/token", ACCOUNTS_BASE),
            search_url: format!("{}/v1/search", API_BASE),
            retry: RetryPolicy::default(),
            token: RefCell::new(None),
        })
    }

    /// Point the client at other hosts, e.g. a local stand-in for the API.
    pub fn with_base_urls(mut self, accounts: &str, api: &str) -> Self {
        self.token_url = format!("{}/api/token", accounts.trim_end_matches('/'));
        self.search_url = format!("{}/v1/search", api.trim_end_matches('/'));
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch a token now so bad credentials fail before any row is processed.
    pub fn authenticate(&self) -> Result<(), LookupError> {
        self.bearer().map(|_| ())
    }

    fn bearer(&self) -> Result<String, LookupError> {
        if let Some(token) = self.token.borrow().as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        debug!("Requesting Spotify access token");
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LookupError::Auth(format!("token request returned {}: {}", status, body)));
        }

        let token: TokenResponse = response.json().map_err(transport)?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SLACK);
        info!("Spotify token acquired (valid {}s)", lifetime.as_secs());

        let value = token.access_token;
        *self.token.borrow_mut() = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    fn invalidate_token(&self) {
        self.token.borrow_mut().take();
    }
}

impl SpotifyClient {
    fn search_once(&self, query: &str) -> Result<Attempt, LookupError> {
        let bearer = self.bearer()?;

        let sent = self
            .client
            .get(&self.search_url)
            .bearer_auth(bearer)
            .query(&[("q", query), ("type", "track"), ("limit", "1")])
            .send();
        let response = match sent {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Ok(Attempt::Retry {
                    error: transport(e),
                    wait: None,
                })
            }
            Err(e) => return Ok(Attempt::Fail(transport(e))),
        };

        let status = response.status();
        if status.is_success() {
            let body: SearchResponse = response.json().map_err(transport)?;
            return Ok(Attempt::Done(
                body.tracks
                    .and_then(|page| page.items.into_iter().next())
                    .map(TrackMetadata::from),
            ));
        }

        Ok(match status {
            StatusCode::UNAUTHORIZED => Attempt::Unauthorized,
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = retry_after(&response);
                Attempt::Retry {
                    error: LookupError::RateLimited { retry_after_secs },
                    wait: retry_after_secs.map(Duration::from_secs),
                }
            }
            s => {
                let error = LookupError::Status {
                    status: s.as_u16(),
                    body: response.text().unwrap_or_default(),
                };
                if s.is_server_error() {
                    Attempt::Retry { error, wait: None }
                } else {
                    Attempt::Fail(error)
                }
            }
        })
    }
}

impl TrackSearch for SpotifyClient {
    fn search_track(&self, query: &str) -> Result<Option<TrackMetadata>, LookupError> {
        let mut retries = 0;
        let mut refreshed = false;
        loop {
            match self.search_once(query)? {
                Attempt::Done(found) => return Ok(found),
                Attempt::Fail(error) => return Err(error),
                Attempt::Unauthorized => {
                    self.invalidate_token();
                    if refreshed {
                        return Err(LookupError::Auth("search rejected the access token".to_string()));
                    }
                    debug!("Search rejected the access token, requesting a new one");
                    refreshed = true;
                }
                Attempt::Retry { error, wait } => {
                    let wait = wait.unwrap_or_else(|| self.retry.backoff_for(retries));
                    if retries >= self.retry.max_retries || wait > self.retry.max_wait {
                        return Err(error);
                    }
                    retries += 1;
                    warn!(
                        "{}; retrying in {:.1}s ({}/{})",
                        error,
                        wait.as_secs_f64(),
                        retries,
                        self.retry.max_retries
                    );
                    thread::sleep(wait);
                }
            }
        }
    }
}
