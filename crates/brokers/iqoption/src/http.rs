use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use optbridge_core::{BridgeError, LoginOutcome, LoginRequest, Profile, SessionProvider};
use reqwest::header::COOKIE;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::IqOptionConfig;
use crate::exchanges::{as_i64, payload};

#[derive(Debug, Serialize)]
struct LoginBody<'a> {
    identifier: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct Session {
    ssid: String,
    expires_at: Option<DateTime<Utc>>,
}

/// HTTP session with the venue, carried by the `ssid` cookie.
///
/// The same ssid is the streaming handshake token.
pub struct HttpSession {
    client: Client,
    config: IqOptionConfig,
    session: RwLock<Option<Session>>,
}

impl HttpSession {
    pub fn new(config: IqOptionConfig) -> Result<Self, BridgeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| BridgeError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            session: RwLock::new(None),
        })
    }

    fn current(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, session: Option<Session>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn ssid(&self) -> Result<String, BridgeError> {
        let session = self
            .current()
            .ok_or_else(|| BridgeError::Session("not logged in".to_string()))?;
        if session.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(BridgeError::Session("session expired".to_string()));
        }
        Ok(session.ssid)
    }

    async fn get_json(&self, url: &str) -> Result<Value, BridgeError> {
        let ssid = self.ssid()?;
        self.get_json_as(url, &ssid).await
    }

    async fn get_json_as(&self, url: &str, ssid: &str) -> Result<Value, BridgeError> {
        let response = self
            .client
            .get(url)
            .header(COOKIE, format!("ssid={}", ssid))
            .send()
            .await
            .map_err(|e| BridgeError::Http(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BridgeError::Session(format!("venue answered {}", status)));
        }
        if !status.is_success() {
            return Err(BridgeError::Http(format!("GET {} answered {}", url, status)));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| BridgeError::Http(format!("Invalid JSON from {}: {}", url, e)))
    }
}

/// The ssid in a login response, at the top level or under `data`.
fn ssid_of(body: &Value) -> Option<String> {
    body.get("ssid")
        .or_else(|| body.get("data").and_then(|d| d.get("ssid")))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn expiry_of(body: &Value) -> Option<DateTime<Utc>> {
    let at = as_i64(payload(body, &["data", "result"]).get("expires_at")?)?;
    Utc.timestamp_opt(at, 0).single()
}

pub(crate) fn profile_of(body: &Value) -> Profile {
    let data = payload(body, &["result", "data"]);
    let int = |key: &str| data.get(key).and_then(as_i64).unwrap_or(0);
    Profile {
        user_group_id: int("user_group_id"),
        is_regulated: data
            .get("is_regulated")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        balance_id: int("balance_id"),
    }
}

#[async_trait]
impl SessionProvider for HttpSession {
    async fn login(&self, credentials: &LoginRequest) -> Result<LoginOutcome, BridgeError> {
        let body = LoginBody {
            identifier: &credentials.identifier,
            password: &credentials.password,
            token: credentials.two_factor_code.as_deref(),
        };
        let response = self
            .client
            .post(&self.config.login_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Http(format!("Login request failed: {}", e)))?;

        let status = response.status();
        let raw: Value = response.json().await.unwrap_or(Value::Null);
        let ssid = ssid_of(&raw);

        let success = status.is_success() && ssid.is_some();
        if let Some(ssid) = ssid.filter(|_| status.is_success()) {
            // The ssid becomes the session only once the venue reports its expiry.
            match self.get_json_as(&self.config.session_url, &ssid).await {
                Ok(session) => match expiry_of(&session) {
                    Some(expires_at) => {
                        self.install(Some(Session {
                            ssid,
                            expires_at: Some(expires_at),
                        }));
                        info!(%expires_at, "Logged in to venue");
                    }
                    None => warn!("Session lookup after login carried no expiry"),
                },
                Err(e) => warn!(error = %e, "Session lookup after login failed"),
            }
        } else {
            warn!(%status, "Venue login rejected");
        }

        Ok(LoginOutcome { success, raw })
    }

    async fn establish_session(&self) -> Result<(), BridgeError> {
        self.get_json(&self.config.session_url).await?;
        debug!("Venue session confirmed");
        Ok(())
    }

    async fn profile(&self) -> Result<Profile, BridgeError> {
        let body = self.get_json(&self.config.profile_url).await?;
        Ok(profile_of(&body))
    }

    fn handshake_token(&self) -> Option<String> {
        self.ssid().ok()
    }
}
