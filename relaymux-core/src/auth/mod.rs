//! Protocol-agnostic access control.
//!
//! Every attempt to interact with a path (publish, read, describe, API call)
//! is funneled through [`AuthManager::authenticate`] with a uniform
//! [`AuthRequest`], regardless of which wire protocol produced it.

mod http_hook;
mod internal;
mod jwt;

pub use http_hook::HttpAuthenticator;
pub use internal::InternalAuthenticator;
pub use jwt::JwtAuthenticator;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conf::Conf;

/// Pacing delay applied by transport adapters after a fatal authentication
/// failure, to cap brute-force throughput.
pub const PAUSE_AFTER_ERROR: Duration = Duration::from_secs(2);

/// Action the requester wants to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthAction {
    Publish,
    Read,
    Playback,
    Api,
    Metrics,
    Pprof,
}

impl fmt::Display for AuthAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Publish => "publish",
            Self::Read => "read",
            Self::Playback => "playback",
            Self::Api => "api",
            Self::Metrics => "metrics",
            Self::Pprof => "pprof",
        };
        f.write_str(s)
    }
}

/// Wire protocol that originated a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rtsp,
    Rtmp,
    Srt,
    Webrtc,
    Hls,
    Whip,
    Api,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Rtsp => "rtsp",
            Self::Rtmp => "rtmp",
            Self::Srt => "srt",
            Self::Webrtc => "webrtc",
            Self::Hls => "hls",
            Self::Whip => "whip",
            Self::Api => "api",
        };
        f.write_str(s)
    }
}

/// User-supplied credentials. RTSP passes hashed forms through
/// [`CredentialsVerifier`] instead of a cleartext password.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
    pub token: String,
}

impl Credentials {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.pass.is_empty() && self.token.is_empty()
    }
}

/// Protocol-defined credential check, e.g. RTSP digest verification against a
/// stored cleartext password. Only consulted when the stored password is not
/// hashed.
pub trait CredentialsVerifier: Send + Sync {
    fn verify(&self, expected_user: &str, expected_pass: &str) -> bool;
}

/// One attempt to interact with a path.
#[derive(Clone)]
pub struct AuthRequest {
    pub action: AuthAction,
    /// Path name. Empty only for API/metrics/pprof authentication.
    pub path: String,
    pub protocol: Protocol,
    pub query: String,
    pub credentials: Option<Credentials>,
    pub ip: IpAddr,
    pub id: Uuid,
    pub custom_verify: Option<Arc<dyn CredentialsVerifier>>,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("action", &self.action)
            .field("path", &self.path)
            .field("protocol", &self.protocol)
            .field("ip", &self.ip)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Authentication failure.
///
/// `ask_credentials` distinguishes "challenge the client" (401-class) from
/// "credentials were provided and are wrong" (403-class). The latter must be
/// followed by a [`PAUSE_AFTER_ERROR`] delay in the transport adapter.
#[derive(Debug, Clone, thiserror::Error)]
#[error("authentication failed: {message}")]
pub struct AuthError {
    pub ask_credentials: bool,
    pub message: String,
}

impl AuthError {
    #[must_use]
    pub fn challenge(message: impl Into<String>) -> Self {
        Self {
            ask_credentials: true,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            ask_credentials: false,
            message: message.into(),
        }
    }
}

/// Successful authentication. The HTTP hook variant may rename the path.
#[derive(Debug, Clone, Default)]
pub struct AuthOutcome {
    pub path_override: Option<String>,
}

/// A single permission entry: action, path pattern, deny flag.
///
/// The pattern is a glob where `*` matches any run of characters; an empty
/// pattern matches every path. Deny entries are evaluated before allow
/// entries; a request with no matching allow entry is denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Permission {
    pub action: AuthAction,
    pub path: String,
    pub deny: bool,
}

impl Default for Permission {
    fn default() -> Self {
        Self {
            action: AuthAction::Read,
            path: String::new(),
            deny: false,
        }
    }
}

impl Permission {
    #[must_use]
    pub fn matches(&self, action: AuthAction, path: &str) -> bool {
        self.action == action && path_glob_matches(&self.path, path)
    }
}

/// Glob match with `*` as the only wildcard. Empty pattern matches anything.
#[must_use]
pub fn path_glob_matches(pattern: &str, path: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for part in pattern.split('*') {
        if !re.ends_with('^') {
            re.push_str(".*");
        }
        re.push_str(&regex::escape(part));
    }
    if pattern.ends_with('*') {
        re.push_str(".*");
    }
    re.push('$');
    regex::Regex::new(&re).map(|r| r.is_match(path)).unwrap_or(false)
}

/// Evaluate a permission list: deny rules first, then allow rules.
#[must_use]
pub fn permissions_allow(perms: &[Permission], action: AuthAction, path: &str) -> bool {
    if perms.iter().any(|p| p.deny && p.matches(action, path)) {
        return false;
    }
    perms.iter().any(|p| !p.deny && p.matches(action, path))
}

/// One entry in the internal user table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct AuthUser {
    /// `any` matches every user name.
    pub user: String,
    /// Cleartext, `sha256:<base64>` or `argon2:<phc string>`. Empty accepts
    /// any password.
    pub pass: String,
    /// Allowed source networks. Empty allows every address.
    pub ips: Vec<String>,
    pub permissions: Vec<Permission>,
}

impl Default for AuthUser {
    fn default() -> Self {
        Self {
            user: "any".to_string(),
            pass: String::new(),
            ips: Vec::new(),
            permissions: Vec::new(),
        }
    }
}

/// Variant over the three authentication backends.
pub enum AuthManager {
    Internal(InternalAuthenticator),
    Http(HttpAuthenticator),
    Jwt(JwtAuthenticator),
}

impl AuthManager {
    /// Build the manager selected by the configuration snapshot.
    pub fn from_conf(conf: &Conf) -> crate::Result<Self> {
        match conf.auth_method {
            crate::conf::AuthMethod::Internal => Ok(Self::Internal(
                InternalAuthenticator::new(conf.auth_internal_users.clone())?,
            )),
            crate::conf::AuthMethod::Http => Ok(Self::Http(HttpAuthenticator::new(
                conf.auth_http_address.clone(),
            )?)),
            crate::conf::AuthMethod::Jwt => Ok(Self::Jwt(JwtAuthenticator::new(
                conf.auth_jwt_jwks.clone(),
                conf.auth_jwt_claim_key.clone(),
            )?)),
        }
    }

    /// Resolve one access request. Never blocks on the answer path beyond the
    /// backend's own I/O (HTTP hook, JWKS refresh).
    pub async fn authenticate(&self, req: &AuthRequest) -> Result<AuthOutcome, AuthError> {
        match self {
            Self::Internal(a) => a.authenticate(req).await,
            Self::Http(a) => a.authenticate(req).await,
            Self::Jwt(a) => a.authenticate(req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_empty_matches_all() {
        assert!(path_glob_matches("", "any/path"));
    }

    #[test]
    fn test_glob_literal() {
        assert!(path_glob_matches("cam1", "cam1"));
        assert!(!path_glob_matches("cam1", "cam2"));
        assert!(!path_glob_matches("cam1", "cam1/sub"));
    }

    #[test]
    fn test_glob_wildcard() {
        assert!(path_glob_matches("cams/*", "cams/front"));
        assert!(path_glob_matches("cams/*", "cams/a/b"));
        assert!(!path_glob_matches("cams/*", "other/front"));
        assert!(path_glob_matches("*", "anything"));
    }

    #[test]
    fn test_glob_escapes_regex_metachars() {
        assert!(path_glob_matches("a.b", "a.b"));
        assert!(!path_glob_matches("a.b", "axb"));
    }

    #[test]
    fn test_permissions_deny_first() {
        let perms = vec![
            Permission {
                action: AuthAction::Read,
                path: String::new(),
                deny: false,
            },
            Permission {
                action: AuthAction::Read,
                path: "secret/*".to_string(),
                deny: true,
            },
        ];
        assert!(permissions_allow(&perms, AuthAction::Read, "cam1"));
        assert!(!permissions_allow(&perms, AuthAction::Read, "secret/cam"));
        assert!(!permissions_allow(&perms, AuthAction::Publish, "cam1"));
    }

    #[test]
    fn test_permissions_empty_denies() {
        assert!(!permissions_allow(&[], AuthAction::Read, "cam1"));
    }
}
