//! Installed-app OAuth for the classroom API.
//!
//! Tokens are kept per scope profile in `token.<profile>.json`. A stored token is used
//! while fresh, refreshed with its refresh token once expired, and otherwise the
//! operator is sent through the consent page and asked to paste the code.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use classroom_sync_core::error::{Result, SyncError};
use classroom_sync_core::session::SessionCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Redirect target for the copy-paste flow; the code shows up in the address bar.
const REDIRECT_URI: &str = "http://localhost";

/// Tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Scope sets the CLI asks for. Each gets its own token file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeProfile {
    /// Create, enroll, remove, archive and list courses.
    Manage,
    /// Read-only roster and announcement access for crawl and get-stream.
    Stream,
}

impl ScopeProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeProfile::Manage => "manage",
            ScopeProfile::Stream => "stream",
        }
    }

    pub fn scopes(&self) -> &'static [&'static str] {
        match self {
            ScopeProfile::Manage => &[
                "https://www.googleapis.com/auth/classroom.courses",
                "https://www.googleapis.com/auth/classroom.rosters",
                "https://www.googleapis.com/auth/classroom.profile.emails",
            ],
            ScopeProfile::Stream => &[
                "https://www.googleapis.com/auth/classroom.courses.readonly",
                "https://www.googleapis.com/auth/classroom.rosters.readonly",
                "https://www.googleapis.com/auth/classroom.profile.emails",
                "https://www.googleapis.com/auth/classroom.announcements.readonly",
            ],
        }
    }

    pub fn token_file(&self, token_dir: &Path) -> PathBuf {
        token_dir.join(format!("token.{}.json", self.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CredentialsFile {
    installed: InstalledSecret,
}

/// Client id and endpoints of an installed-app OAuth client.
#[derive(Debug, Clone, Deserialize)]
pub struct InstalledSecret {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
}

/// What is persisted in a token file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl StoredToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_SKEW_SECS) > now
    }

    /// Whether this token was granted for every scope of `profile`.
    pub fn covers(&self, profile: ScopeProfile) -> bool {
        profile
            .scopes()
            .iter()
            .all(|scope| self.scopes.iter().any(|s| s == scope))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Hands out access tokens, at most one acquisition per profile per run.
pub struct Authenticator {
    http: reqwest::Client,
    secret: InstalledSecret,
    token_dir: PathBuf,
    tokens: SessionCache<ScopeProfile, String>,
}

impl Authenticator {
    pub fn new(secret: InstalledSecret, token_dir: impl Into<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            secret,
            token_dir: token_dir.into(),
            tokens: SessionCache::new(),
        }
    }

    /// Read the client secret from a `credentials.json` in installed-app format.
    pub fn from_credentials_file(credentials: &Path, token_dir: impl Into<PathBuf>) -> Result<Self> {
        let raw = std::fs::read_to_string(credentials).map_err(|e| {
            SyncError::LocalAuth(format!(
                "cannot read credentials {}: {e}",
                credentials.display()
            ))
        })?;
        let parsed: CredentialsFile = serde_json::from_str(&raw).map_err(|e| {
            SyncError::LocalAuth(format!(
                "credentials {} is not an installed-app client secret: {e}",
                credentials.display()
            ))
        })?;
        Ok(Self::new(parsed.installed, token_dir))
    }

    /// A usable access token for `profile`.
    pub async fn access_token(&self, profile: ScopeProfile) -> Result<String> {
        self.tokens
            .get_or_try_init(&profile, || self.acquire(profile))
            .await
    }

    async fn acquire(&self, profile: ScopeProfile) -> Result<String> {
        let path = profile.token_file(&self.token_dir);
        let stored = self.read_token(&path);

        if let Some(token) = &stored {
            if token.is_fresh(Utc::now()) && token.covers(profile) {
                debug!(profile = profile.as_str(), "Using stored access token");
                return Ok(token.access_token.clone());
            }
        }

        let refreshed = match stored.as_ref().and_then(|t| t.refresh_token.clone()) {
            Some(refresh_token) => match self.refresh(profile, &refresh_token).await {
                Ok(token) => Some(token),
                Err(err) => {
                    warn!(profile = profile.as_str(), error = %err, "Token refresh failed; asking for consent");
                    None
                }
            },
            None => None,
        };
        let token = match refreshed {
            Some(token) => token,
            None => self.consent(profile).await?,
        };

        self.write_token(&path, &token)?;
        info!(profile = profile.as_str(), expires_at = %token.expires_at, "Access token stored");
        Ok(token.access_token)
    }

    fn read_token(&self, path: &Path) -> Option<StoredToken> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable token file");
                None
            }
        }
    }

    fn write_token(&self, path: &Path, token: &StoredToken) -> Result<()> {
        let body = serde_json::to_string_pretty(token)
            .map_err(|e| SyncError::LocalAuth(format!("cannot encode token: {e}")))?;
        std::fs::write(path, body).map_err(|e| SyncError::io(path, e))
    }

    async fn refresh(&self, profile: ScopeProfile, refresh_token: &str) -> Result<StoredToken> {
        info!(profile = profile.as_str(), "Refreshing access token");
        let params = [
            ("client_id", self.secret.client_id.as_str()),
            ("client_secret", self.secret.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let response = self.token_request(&params).await?;
        Ok(StoredToken {
            access_token: response.access_token,
            // Refresh responses usually omit the refresh token; keep the old one.
            refresh_token: response
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: expiry(response.expires_in),
            scopes: profile.scopes().iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn consent(&self, profile: ScopeProfile) -> Result<StoredToken> {
        let url = self.consent_url(profile);
        eprintln!(
            "Authorize classroom-sync ({} access) by visiting:\n\n{url}\n",
            profile.as_str()
        );
        let code = read_off_runtime(|| {
            dialoguer::Input::<String>::new()
                .with_prompt("Authorization code")
                .interact_text()
                .map_err(|e| e.to_string())
        })
        .await?;

        let params = [
            ("client_id", self.secret.client_id.as_str()),
            ("client_secret", self.secret.client_secret.as_str()),
            ("code", code.trim()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", REDIRECT_URI),
        ];
        let response = self.token_request(&params).await?;
        Ok(StoredToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: expiry(response.expires_in),
            scopes: profile.scopes().iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn consent_url(&self, profile: ScopeProfile) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
            self.secret.auth_uri,
            urlencoding::encode(&self.secret.client_id),
            urlencoding::encode(REDIRECT_URI),
            urlencoding::encode(&profile.scopes().join(" ")),
        )
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.secret.token_uri)
            .form(params)
            .send()
            .await
            .map_err(|e| SyncError::LocalAuth(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::LocalAuth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| SyncError::LocalAuth(format!("token response parse failed: {e}")))
    }
}

fn expiry(expires_in: Option<i64>) -> DateTime<Utc> {
    Utc::now() + Duration::seconds(expires_in.unwrap_or(3600))
}

/// Run a blocking terminal read on the blocking pool so the runtime keeps polling.
async fn read_off_runtime<F>(read: F) -> Result<String>
where
    F: FnOnce() -> std::result::Result<String, String> + Send + 'static,
{
    tokio::task::spawn_blocking(read)
        .await
        .map_err(|e| SyncError::LocalAuth(format!("authorization prompt failed: {e}")))?
        .map_err(|e| SyncError::LocalAuth(format!("no authorization code entered: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn secret(token_uri: &str) -> InstalledSecret {
        InstalledSecret {
            client_id: "client-1".into(),
            client_secret: "shh".into(),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".into(),
            token_uri: token_uri.into(),
        }
    }

    fn stored(expires_at: DateTime<Utc>, refresh: Option<&str>, profile: ScopeProfile) -> StoredToken {
        StoredToken {
            access_token: "stored-access".into(),
            refresh_token: refresh.map(str::to_string),
            expires_at,
            scopes: profile.scopes().iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn fresh_stored_token_is_used_without_network() {
        let dir = TempDir::new().unwrap();
        let token = stored(Utc::now() + Duration::hours(1), None, ScopeProfile::Manage);
        std::fs::write(
            ScopeProfile::Manage.token_file(dir.path()),
            serde_json::to_string(&token).unwrap(),
        )
        .unwrap();

        let auth = Authenticator::new(secret("http://127.0.0.1:1/token"), dir.path());
        assert_eq!(
            auth.access_token(ScopeProfile::Manage).await.unwrap(),
            "stored-access"
        );
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let token = stored(Utc::now() - Duration::minutes(5), Some("r-1"), ScopeProfile::Stream);
        let file = ScopeProfile::Stream.token_file(dir.path());
        std::fs::write(&file, serde_json::to_string(&token).unwrap()).unwrap();

        let auth = Authenticator::new(secret(&format!("{}/token", server.uri())), dir.path());
        assert_eq!(auth.access_token(ScopeProfile::Stream).await.unwrap(), "new-access");
        // Second call is served from the session cache.
        assert_eq!(auth.access_token(ScopeProfile::Stream).await.unwrap(), "new-access");

        let persisted: StoredToken =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(persisted.access_token, "new-access");
        assert_eq!(persisted.refresh_token.as_deref(), Some("r-1"));
        assert!(persisted.is_fresh(Utc::now()));
    }

    #[test]
    fn tokens_expiring_within_the_skew_are_stale() {
        let now = Utc::now();
        assert!(!stored(now + Duration::seconds(30), None, ScopeProfile::Manage).is_fresh(now));
        assert!(stored(now + Duration::minutes(10), None, ScopeProfile::Manage).is_fresh(now));
    }

    #[test]
    fn manage_token_does_not_cover_stream_scopes() {
        let token = stored(Utc::now(), None, ScopeProfile::Manage);
        assert!(token.covers(ScopeProfile::Manage));
        assert!(!token.covers(ScopeProfile::Stream));
    }

    #[test]
    fn credentials_file_must_be_installed_app_format() {
        let dir = TempDir::new().unwrap();
        let creds = dir.path().join("credentials.json");
        std::fs::write(&creds, r#"{"web": {"client_id": "x"}}"#).unwrap();
        let err = Authenticator::from_credentials_file(&creds, dir.path())
            .err()
            .unwrap();
        assert_eq!(err.tag(), "LocalAuthError");

        std::fs::write(
            &creds,
            r#"{"installed": {"client_id": "c", "client_secret": "s",
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": "https://oauth2.googleapis.com/token"}}"#,
        )
        .unwrap();
        let auth = Authenticator::from_credentials_file(&creds, dir.path()).unwrap();
        let url = auth.consent_url(ScopeProfile::Manage);
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?client_id=c&"));
        assert!(url.contains("classroom.rosters"));
    }

    #[tokio::test]
    async fn prompt_runs_off_the_runtime_thread() {
        let (tx, rx) = std::sync::mpsc::channel::<String>();
        // Single-threaded runtime: this task only runs if the read does not block it.
        tokio::spawn(async move {
            tx.send("4/abc".to_string()).unwrap();
        });

        let code = read_off_runtime(move || {
            rx.recv_timeout(std::time::Duration::from_secs(5))
                .map_err(|e| e.to_string())
        })
        .await
        .unwrap();
        assert_eq!(code, "4/abc");
    }

    #[tokio::test]
    async fn failed_prompt_is_an_auth_error() {
        let err = read_off_runtime(|| Err("not a terminal".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LocalAuth(msg) if msg.contains("not a terminal")));
    }
}
