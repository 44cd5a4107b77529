//! Session token lifecycle: login, unverified claim inspection, and
//! scheduled refresh.
//!
//! The platform's JWTs are opaque bearer tokens to this crate — we
//! never need to verify the signature, only read `exp`/`aud`/subject
//! claims to know who we are and when to refresh. Decoding the payload
//! segment ourselves (base64 + `serde_json`) avoids pulling in a full
//! JWT-verification crate like `jsonwebtoken` for a check we deliberately
//! do not perform.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use tokio::sync::{watch, Mutex};

use crate::config::Credentials;
use crate::error::Error;
use crate::logging::LogSink;
use crate::model::ExtraClaims;
use crate::Result;

const AUTH_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Who this session authenticates as, decoded from the token's claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// A client-credentials (bot) session, identified by client id.
    Bot { client_id: String },
    /// A user session, identified by account id.
    User { user_id: String },
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    nbf: Option<i64>,
    exp: i64,
    #[allow(dead_code)]
    aud: Option<String>,
    #[serde(rename = "client_sub")]
    client_sub: Option<String>,
    sub: Option<String>,
    #[serde(flatten)]
    #[allow(dead_code)]
    extra: ExtraClaims,
}

/// Decodes the payload segment of a JWT without checking its signature.
fn decode_claims(token: &str) -> Result<Claims> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::config("malformed session token: missing payload segment"))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(payload))
        .map_err(|e| Error::config(format!("malformed session token: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::config(format!("malformed session token claims: {e}")))
}

/// Hashes a password to the lowercase hex SHA-512 digest the platform
/// expects, unless it already looks like one.
///
/// Idempotent: calling this on an already-hashed value returns it
/// unchanged, so callers can pass either a plaintext password or a
/// precomputed hash without knowing which.
pub(crate) fn ensure_password_hash(password_or_hash: &str) -> String {
    // 128 lowercase hex chars == SHA-512 digest already.
    let looks_hashed = Regex::new(r"^[0-9a-f]{128}$")
        .unwrap()
        .is_match(&password_or_hash.to_lowercase())
        && password_or_hash.len() == 128
        && password_or_hash.chars().all(|c| c.is_ascii_hexdigit());
    if looks_hashed {
        return password_or_hash.to_lowercase();
    }
    let digest = Sha512::digest(password_or_hash.as_bytes());
    hex::encode(digest)
}

/// A live session token plus the principal it was issued to.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub access_token: Arc<str>,
    pub principal: Principal,
    pub expires_at_unix: i64,
}

/// Owns the login/refresh cycle against the token endpoint and
/// broadcasts the current [`Session`] to every interested task.
pub(crate) struct TokenManager {
    token_url: String,
    sessions_url: String,
    x_api_key: String,
    user_agent: String,
    credentials: Credentials,
    http: reqwest::Client,
    log: LogSink,
    refreshing: Mutex<()>,
    tx: watch::Sender<Option<Session>>,
}

impl TokenManager {
    pub(crate) fn new(
        token_url: String,
        sessions_url: String,
        x_api_key: String,
        user_agent: String,
        credentials: Credentials,
        log: LogSink,
    ) -> (Arc<Self>, watch::Receiver<Option<Session>>) {
        let (tx, rx) = watch::channel(None);
        let http = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .build()
            .expect("reqwest client builder with static config never fails");
        let mgr = Arc::new(Self {
            token_url,
            sessions_url,
            x_api_key,
            user_agent,
            credentials,
            http,
            log,
            refreshing: Mutex::new(()),
            tx,
        });
        (mgr, rx)
    }

    /// Logs in (or refreshes) and then spawns the scheduled-refresh
    /// background task. Retries indefinitely on auth failure; this is
    /// the "AuthError is a soft failure" behaviour from the
    /// specification — it is never surfaced to the caller, only
    /// logged and retried every ten seconds.
    pub(crate) async fn start(self: &Arc<Self>) {
        loop {
            match self.login_once().await {
                Ok(session) => {
                    self.schedule_refresh(Arc::clone(self), session);
                    return;
                }
                Err(e) => {
                    self.log
                        .warn(&format!("authentication failed, retrying in 10s: {e}"));
                    tokio::time::sleep(AUTH_RETRY_DELAY).await;
                }
            }
        }
    }

    fn schedule_refresh(self: &Arc<Self>, mgr: Arc<Self>, session: Session) {
        let _ = mgr.tx.send(Some(session.clone()));
        let delay = refresh_delay(session.expires_at_unix);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mgr.refresh_loop().await;
        });
    }

    /// Refreshes the session forever, on the schedule each new token's
    /// expiry implies. Only one refresh cycle may run at a time;
    /// `refreshing` exists so a future on-demand refresh (triggered by
    /// e.g. a 401 from the REST gateway) can't race the scheduled one.
    async fn refresh_loop(self: Arc<Self>) {
        let _guard = self.refreshing.lock().await;
        loop {
            match self.login_once().await {
                Ok(session) => {
                    let delay = refresh_delay(session.expires_at_unix);
                    let _ = self.tx.send(Some(session));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.log
                        .warn(&format!("token refresh failed, retrying in 10s: {e}"));
                    tokio::time::sleep(AUTH_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Bot credentials authenticate as a form-encoded `client_credentials`
    /// grant against `token_url`; User credentials authenticate as a JSON
    /// `{username, password_hash}` body against the separate
    /// `sessions_url` — the two endpoints and wire shapes are distinct,
    /// not two grant types on the same endpoint.
    async fn login_once(&self) -> Result<Session> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let resp = match &self.credentials {
            Credentials::Bot {
                client_id,
                client_secret,
                scopes,
            } => {
                let scope = scopes
                    .iter()
                    .map(|s| s.0.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", scope.as_str()),
                ];
                self.http
                    .post(&self.token_url)
                    .header("user-agent", &self.user_agent)
                    .form(&form)
                    .send()
                    .await
            }
            Credentials::User {
                username,
                password_hash,
            } => {
                #[derive(serde::Serialize)]
                struct UserBody<'a> {
                    username: &'a str,
                    password_hash: String,
                }
                let body = UserBody {
                    username,
                    password_hash: ensure_password_hash(password_hash),
                };
                self.http
                    .post(&self.sessions_url)
                    .header("x-api-key", &self.x_api_key)
                    .json(&body)
                    .send()
                    .await
            }
        }
        .map_err(|e| Error::TransientNetwork(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::TransientNetwork(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;

        let claims = decode_claims(&parsed.access_token)?;
        let principal = match (&claims.client_sub, &claims.sub) {
            (Some(client_id), _) => Principal::Bot {
                client_id: client_id.clone(),
            },
            (None, Some(sub)) => Principal::User {
                user_id: sub.clone(),
            },
            (None, None) => {
                return Err(Error::config(
                    "session token carries neither client_sub nor sub claim",
                ))
            }
        };

        Ok(Session {
            access_token: Arc::from(parsed.access_token.as_str()),
            principal,
            expires_at_unix: claims.exp,
        })
    }
}

/// `floor(0.9 * (expiry*1000 - now_ms))`, clamped to zero, converted
/// back to a `Duration`.
fn refresh_delay(expires_at_unix: i64) -> Duration {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let expiry_ms = expires_at_unix * 1000;
    let remaining_ms = ((expiry_ms - now_ms) as f64 * 0.9).floor();
    if remaining_ms <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_millis(remaining_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_idempotent() {
        let hashed = ensure_password_hash("hunter2");
        assert_eq!(hashed.len(), 128);
        assert_eq!(ensure_password_hash(&hashed), hashed);
        assert_eq!(ensure_password_hash(&hashed.to_uppercase()), hashed);
    }

    #[test]
    fn refresh_delay_is_ninety_percent_of_remaining_window() {
        let now = chrono::Utc::now().timestamp();
        let delay = refresh_delay(now + 1000);
        assert!(delay.as_millis() > 0);
        assert!(delay.as_secs() < 1000);
    }

    #[test]
    fn refresh_delay_floors_at_zero_for_expired_tokens() {
        let past = chrono::Utc::now().timestamp() - 1000;
        assert_eq!(refresh_delay(past), Duration::ZERO);
    }

    #[test]
    fn decode_claims_rejects_token_without_payload_segment() {
        let err = decode_claims("onlyheader").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
