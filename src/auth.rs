//! Session / identity gate
//!
//! Every gateway request must carry a valid session before it is routed.
//! The gate only needs a [`SessionValidator`]; [`JwtSessions`] is the
//! built-in implementation backed by signed, expiring tokens.

use crate::config::AuthSettings;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use hyper::header::{HeaderMap, AUTHORIZATION, COOKIE};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub role: String,
    pub jti: String,
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub user: String,
    pub role: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Capability to turn a token into a session. Must be a pure read.
pub trait SessionValidator: Send + Sync {
    fn validate(&self, token: &str) -> Option<Session>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub token_expiry_hours: i64,
    pub cookie_name: String,
    pub cookie_secure: bool,
    pub cookie_http_only: bool,
    pub cookie_same_site: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::from(&AuthSettings::default())
    }
}

impl From<&AuthSettings> for AuthConfig {
    fn from(settings: &AuthSettings) -> Self {
        Self {
            secret: settings
                .secret
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            token_expiry_hours: settings.token_expiry_hours,
            cookie_name: settings.cookie_name.clone(),
            cookie_secure: settings.cookie_secure,
            cookie_http_only: settings.cookie_http_only,
            cookie_same_site: settings.cookie_same_site.clone(),
        }
    }
}

/// Signed session tokens with a logout revocation list
pub struct JwtSessions {
    config: Arc<AuthConfig>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    /// Revoked token ids -> their expiry, pruned once expired
    revoked: DashMap<String, i64>,
}

impl JwtSessions {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config: Arc::new(config),
            encoding_key,
            decoding_key,
            revoked: DashMap::new(),
        }
    }

    /// Create a session for `user` (login)
    pub fn issue(&self, user: &str, role: &str) -> Result<(String, Session), jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.config.token_expiry_hours);

        let claims = Claims {
            sub: user.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            role: role.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)?;
        Ok((token, session_from(claims)))
    }

    /// Decode and check signature and expiry. Ignores revocation.
    pub fn verify(&self, token: &str) -> Result<Session, jsonwebtoken::errors::Error> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(session_from(data.claims))
    }

    /// Destroy a session (logout). Returns false if the token was not valid.
    pub fn revoke(&self, token: &str) -> bool {
        let Ok(session) = self.verify(token) else {
            return false;
        };
        let now = Utc::now().timestamp();
        self.revoked.retain(|_, exp| *exp > now);
        self.revoked
            .insert(session.token_id, session.expires_at.timestamp());
        true
    }

    pub fn create_session_cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}",
            self.config.cookie_name,
            token,
            self.config.token_expiry_hours * 3600
        );

        if self.config.cookie_http_only {
            cookie.push_str("; HttpOnly");
        }

        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }

        cookie.push_str(&format!("; SameSite={}", self.config.cookie_same_site));

        cookie
    }

    pub fn create_logout_cookie(&self) -> String {
        format!(
            "{}=; Path=/; Max-Age=0; HttpOnly; SameSite={}",
            self.config.cookie_name, self.config.cookie_same_site
        )
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

fn session_from(claims: Claims) -> Session {
    Session {
        user: claims.sub,
        role: claims.role,
        token_id: claims.jti,
        expires_at: Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
    }
}

impl SessionValidator for JwtSessions {
    fn validate(&self, token: &str) -> Option<Session> {
        let session = self.verify(token).ok()?;
        if self.revoked.contains_key(&session.token_id) {
            return None;
        }
        Some(session)
    }
}

/// The single authorization point in front of the router
pub struct IdentityGate {
    validator: Arc<dyn SessionValidator>,
    cookie_name: String,
}

impl IdentityGate {
    pub fn new(validator: Arc<dyn SessionValidator>, cookie_name: impl Into<String>) -> Self {
        Self {
            validator,
            cookie_name: cookie_name.into(),
        }
    }

    /// Validate the caller's session. Reads only the request headers and
    /// the validator, never the service registry.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Session, GateError> {
        let token = self
            .extract_token(headers)
            .ok_or(GateError::Unauthenticated("missing session token"))?;

        let session = self
            .validator
            .validate(&token)
            .ok_or(GateError::Unauthenticated("invalid or expired session"))?;

        if session.is_expired_at(Utc::now()) {
            debug!(user = %session.user, "Rejected expired session");
            return Err(GateError::Unauthenticated("invalid or expired session"));
        }

        Ok(session)
    }

    /// Bearer token first, then the session cookie
    pub fn extract_token(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(token) = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            return Some(token.to_string());
        }

        let prefix = format!("{}=", self.cookie_name);
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .map(str::trim)
            .filter_map(|cookie| cookie.strip_prefix(prefix.as_str()))
            .find(|value| !value.is_empty())
            .map(String::from)
    }
}
