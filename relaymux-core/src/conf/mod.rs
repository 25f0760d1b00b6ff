//! Global and per-path configuration.
//!
//! A [`Conf`] is an immutable snapshot: mutations go through
//! [`Conf::patched_with`], which clones the tree, merges a partial JSON
//! document and re-validates, so readers can hold an `Arc<Conf>` without ever
//! observing a half-applied change.

mod duration;
mod path;

pub use duration::HumanDuration;
pub use path::{validate_path_name, PathConf, RecordFormat};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::auth::{AuthAction, AuthUser, Permission};
use crate::{Error, Result};

/// Selected authentication backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Internal,
    Http,
    Jwt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Conf {
    // logging
    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<String>,

    // timeouts and limits
    pub read_timeout: HumanDuration,
    pub write_timeout: HumanDuration,
    /// Per-reader queue size; must be a power of two >= 8.
    pub write_queue_size: usize,
    pub max_payload_size: usize,

    // authentication
    pub auth_method: AuthMethod,
    pub auth_internal_users: Vec<AuthUser>,
    pub auth_http_address: String,
    #[serde(rename = "authJWTJWKS")]
    pub auth_jwt_jwks: String,
    #[serde(rename = "authJWTClaimKey")]
    pub auth_jwt_claim_key: String,
    pub auth_pause_after_error: HumanDuration,

    // admin API
    pub api: bool,
    pub api_address: String,
    pub api_allow_origin: String,

    // playback server
    pub playback: bool,
    pub playback_address: String,

    // protocol servers (adapters live outside the core; the core only knows
    // whether each one is enabled and where it listens)
    pub rtsp: bool,
    pub rtsp_address: String,
    /// RTSP stream transports.
    pub protocols: Vec<String>,
    pub rtmp: bool,
    pub rtmp_address: String,
    pub srt: bool,
    pub srt_address: String,
    pub hls: bool,
    pub hls_address: String,
    pub webrtc: bool,
    pub webrtc_address: String,

    // paths
    pub path_defaults: PathConf,
    pub paths: IndexMap<String, PathConf>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_file: None,
            read_timeout: HumanDuration::from_secs(10),
            write_timeout: HumanDuration::from_secs(10),
            write_queue_size: 512,
            max_payload_size: 1472,
            auth_method: AuthMethod::Internal,
            auth_internal_users: default_internal_users(),
            auth_http_address: String::new(),
            auth_jwt_jwks: String::new(),
            auth_jwt_claim_key: "relaymux_permissions".to_string(),
            auth_pause_after_error: HumanDuration::from_secs(2),
            api: true,
            api_address: "127.0.0.1:9997".to_string(),
            api_allow_origin: "*".to_string(),
            playback: false,
            playback_address: ":9996".to_string(),
            rtsp: true,
            rtsp_address: ":8554".to_string(),
            protocols: vec![
                "udp".to_string(),
                "multicast".to_string(),
                "tcp".to_string(),
            ],
            rtmp: true,
            rtmp_address: ":1935".to_string(),
            srt: true,
            srt_address: ":8890".to_string(),
            hls: true,
            hls_address: ":8888".to_string(),
            webrtc: true,
            webrtc_address: ":8889".to_string(),
            path_defaults: PathConf::default(),
            paths: IndexMap::new(),
        }
    }
}

/// Out-of-the-box user table: anyone can publish/read/playback, the API is
/// reachable from localhost only.
fn default_internal_users() -> Vec<AuthUser> {
    vec![
        AuthUser {
            user: "any".to_string(),
            pass: String::new(),
            ips: Vec::new(),
            permissions: vec![
                Permission {
                    action: AuthAction::Publish,
                    path: String::new(),
                    deny: false,
                },
                Permission {
                    action: AuthAction::Read,
                    path: String::new(),
                    deny: false,
                },
                Permission {
                    action: AuthAction::Playback,
                    path: String::new(),
                    deny: false,
                },
            ],
        },
        AuthUser {
            user: "any".to_string(),
            pass: String::new(),
            ips: vec!["127.0.0.1/32".to_string(), "::1/128".to_string()],
            permissions: vec![
                Permission {
                    action: AuthAction::Api,
                    path: String::new(),
                    deny: false,
                },
                Permission {
                    action: AuthAction::Metrics,
                    path: String::new(),
                    deny: false,
                },
                Permission {
                    action: AuthAction::Pprof,
                    path: String::new(),
                    deny: false,
                },
            ],
        },
    ]
}

impl Conf {
    /// Deserialize from a JSON document, cascading `pathDefaults` into every
    /// path entry for fields the entry does not set itself.
    pub fn from_json_value(doc: serde_json::Value) -> Result<Self> {
        let raw_paths = doc
            .get("paths")
            .and_then(|p| p.as_object())
            .cloned()
            .unwrap_or_default();

        let mut conf: Self = serde_json::from_value(doc)
            .map_err(|e| Error::Validation(format!("json: {e}")))?;

        let mut paths = IndexMap::with_capacity(raw_paths.len());
        for (name, raw) in raw_paths {
            let mut entry = conf.path_defaults.patched_with(&raw)?;
            entry.name.clone_from(&name);
            paths.insert(name, entry);
        }
        conf.paths = paths;
        Ok(conf)
    }

    /// Produce a copy with `patch` merged over this conf. Unknown fields and
    /// type mismatches are rejected; the result is NOT yet validated.
    pub fn patched_with(&self, patch: &serde_json::Value) -> Result<Self> {
        if !patch.is_object() {
            return Err(Error::Validation("patch must be a JSON object".to_string()));
        }
        let mut doc = serde_json::to_value(self).map_err(|e| Error::Validation(e.to_string()))?;
        check_known_fields(&doc, patch)?;
        merge_json(&mut doc, patch);
        Self::from_json_value(doc)
    }

    /// Semantic checks over the whole tree.
    pub fn validate(&self) -> Result<()> {
        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(Error::Validation(format!("invalid logLevel '{other}'")));
            }
        }
        match self.log_format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(Error::Validation(format!("invalid logFormat '{other}'")));
            }
        }

        if self.write_queue_size < 8 || !self.write_queue_size.is_power_of_two() {
            return Err(Error::Validation(
                "writeQueueSize must be a power of two greater than or equal to 8".to_string(),
            ));
        }
        if self.max_payload_size < 1200 {
            return Err(Error::Validation(
                "maxPayloadSize must be at least 1200".to_string(),
            ));
        }

        if self.protocols.is_empty() {
            return Err(Error::Validation("protocols can not be empty".to_string()));
        }
        for p in &self.protocols {
            if !matches!(p.as_str(), "udp" | "multicast" | "tcp") {
                return Err(Error::Validation(format!("invalid protocol '{p}'")));
            }
        }

        match self.auth_method {
            AuthMethod::Internal => {
                for u in &self.auth_internal_users {
                    for ip in &u.ips {
                        if ip.parse::<ipnet::IpNet>().is_err()
                            && ip.parse::<std::net::IpAddr>().is_err()
                        {
                            return Err(Error::Validation(format!(
                                "invalid IP or network '{ip}'"
                            )));
                        }
                    }
                }
            }
            AuthMethod::Http => {
                url::Url::parse(&self.auth_http_address).map_err(|e| {
                    Error::Validation(format!(
                        "invalid authHTTPAddress '{}': {e}",
                        self.auth_http_address
                    ))
                })?;
            }
            AuthMethod::Jwt => {
                url::Url::parse(&self.auth_jwt_jwks).map_err(|e| {
                    Error::Validation(format!(
                        "invalid authJWTJWKS '{}': {e}",
                        self.auth_jwt_jwks
                    ))
                })?;
            }
        }

        if self.api && self.api_address.is_empty() {
            return Err(Error::Validation("apiAddress can not be empty".to_string()));
        }
        if self.api_allow_origin.is_empty() {
            return Err(Error::Validation(
                "apiAllowOrigin can not be empty".to_string(),
            ));
        }

        self.path_defaults.validate("")?;
        for (name, conf) in &self.paths {
            conf.validate(name)?;
        }

        Ok(())
    }
}

/// Reject patch keys that no field of the patched document answers to.
///
/// Every field serializes under `#[serde(default)]`, so the serialized
/// document carries the complete key set. The message is the exact string
/// the API surface promises for unknown fields.
pub(crate) fn check_known_fields(
    doc: &serde_json::Value,
    patch: &serde_json::Value,
) -> Result<()> {
    if let (Some(doc_map), Some(patch_map)) = (doc.as_object(), patch.as_object()) {
        for key in patch_map.keys() {
            if !doc_map.contains_key(key) {
                return Err(Error::Validation(format!(
                    "json: unknown field \"{key}\""
                )));
            }
        }
    }
    Ok(())
}

/// Deep-merge `patch` into `doc`: objects merge recursively, everything else
/// replaces.
pub(crate) fn merge_json(doc: &mut serde_json::Value, patch: &serde_json::Value) {
    match (doc, patch) {
        (serde_json::Value::Object(doc_map), serde_json::Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match doc_map.get_mut(key) {
                    Some(doc_value) if doc_value.is_object() && patch_value.is_object() => {
                        merge_json(doc_value, patch_value);
                    }
                    _ => {
                        doc_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (doc_slot, _) => {
            *doc_slot = patch.clone();
        }
    }
}
