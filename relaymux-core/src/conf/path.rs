use serde::{Deserialize, Serialize};

use super::duration::HumanDuration;
use super::merge_json;
use crate::{Error, Result};

/// On-disk container format for recorded segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Fmp4,
    Mpegts,
}

impl RecordFormat {
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Fmp4 => ".mp4",
            Self::Mpegts => ".ts",
        }
    }
}

/// The authoritative recipe for a path: either a literal name or a
/// `~`-prefixed regular expression template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct PathConf {
    pub name: String,

    // source
    /// "publisher" accepts an incoming publisher; a URL pulls from it.
    pub source: String,
    /// Pull the source only while at least one reader is present.
    pub source_on_demand: bool,
    pub source_on_demand_start_timeout: HumanDuration,
    pub source_on_demand_close_after: HumanDuration,
    /// Redirect describe requests here when no stream is available.
    pub fallback: String,

    // readers
    /// 0 means unlimited.
    pub max_readers: usize,

    // per-path credential overrides
    pub publish_user: String,
    pub publish_pass: String,
    pub read_user: String,
    pub read_pass: String,

    // recording
    pub record: bool,
    pub record_path: String,
    pub record_format: RecordFormat,
    pub record_segment_duration: HumanDuration,
    /// 0 disables automatic deletion.
    pub record_delete_after: HumanDuration,

    // transport preferences
    pub rtsp_transport: String,
    pub srt_read_passphrase: String,
    pub srt_publish_passphrase: String,

    // raspberry camera source
    pub rpi_camera_width: u32,
    pub rpi_camera_height: u32,
    pub rpi_camera_v_flip: bool,
    pub rpi_camera_h_flip: bool,

    // hooks
    pub run_on_init: String,
    pub run_on_init_restart: bool,
    pub run_on_demand: String,
    pub run_on_demand_restart: bool,
    pub run_on_demand_start_timeout: HumanDuration,
    pub run_on_demand_close_after: HumanDuration,
    pub run_on_ready: String,
    pub run_on_ready_restart: bool,
    pub run_on_not_ready: String,
    pub run_on_read: String,
    pub run_on_unread: String,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: "publisher".to_string(),
            source_on_demand: false,
            source_on_demand_start_timeout: HumanDuration::from_secs(10),
            source_on_demand_close_after: HumanDuration::from_secs(10),
            fallback: String::new(),
            max_readers: 0,
            publish_user: String::new(),
            publish_pass: String::new(),
            read_user: String::new(),
            read_pass: String::new(),
            record: false,
            record_path: "./recordings/%path/%Y-%m-%d_%H-%M-%S-%f".to_string(),
            record_format: RecordFormat::Fmp4,
            record_segment_duration: HumanDuration::from_secs(3600),
            record_delete_after: HumanDuration::default(),
            rtsp_transport: "automatic".to_string(),
            srt_read_passphrase: String::new(),
            srt_publish_passphrase: String::new(),
            rpi_camera_width: 1920,
            rpi_camera_height: 1080,
            rpi_camera_v_flip: false,
            rpi_camera_h_flip: false,
            run_on_init: String::new(),
            run_on_init_restart: false,
            run_on_demand: String::new(),
            run_on_demand_restart: false,
            run_on_demand_start_timeout: HumanDuration::from_secs(10),
            run_on_demand_close_after: HumanDuration::from_secs(10),
            run_on_ready: String::new(),
            run_on_ready_restart: false,
            run_on_not_ready: String::new(),
            run_on_read: String::new(),
            run_on_unread: String::new(),
        }
    }
}

const SOURCE_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "rtmps", "srt", "http", "https", "whep"];

impl PathConf {
    /// Whether this conf is a regex template rather than a literal name.
    #[must_use]
    pub fn is_regex(&self) -> bool {
        self.name.starts_with('~')
    }

    /// Whether the source is an incoming publisher (as opposed to a pull URL).
    #[must_use]
    pub fn has_publisher_source(&self) -> bool {
        self.source == "publisher"
    }

    /// Whether readers trigger activation instead of finding a running source.
    #[must_use]
    pub fn is_on_demand(&self) -> bool {
        (!self.has_publisher_source() && self.source_on_demand) || !self.run_on_demand.is_empty()
    }

    /// Produce a copy with `patch` merged over this conf. Unknown fields and
    /// type mismatches are rejected.
    pub fn patched_with(&self, patch: &serde_json::Value) -> Result<Self> {
        if !patch.is_object() {
            return Err(Error::Validation("patch must be a JSON object".to_string()));
        }
        let mut doc = serde_json::to_value(self)
            .map_err(|e| Error::Validation(e.to_string()))?;
        super::check_known_fields(&doc, patch)?;
        merge_json(&mut doc, patch);
        serde_json::from_value(doc).map_err(|e| Error::Validation(format!("json: {e}")))
    }

    /// Semantic checks. `name` overrides the embedded name (empty for path
    /// defaults, which skip name-dependent checks).
    pub fn validate(&self, name: &str) -> Result<()> {
        if !name.is_empty() {
            validate_path_name(name)?;
        }

        if !self.has_publisher_source() {
            let url = url::Url::parse(&self.source).map_err(|e| {
                Error::Validation(format!("invalid source '{}': {e}", self.source))
            })?;
            if !SOURCE_SCHEMES.contains(&url.scheme()) {
                return Err(Error::Validation(format!(
                    "unsupported source scheme '{}'",
                    url.scheme()
                )));
            }
        } else if self.source_on_demand {
            return Err(Error::Validation(
                "sourceOnDemand is useless when source is 'publisher'".to_string(),
            ));
        }

        if !self.run_on_demand.is_empty() && !self.has_publisher_source() {
            return Err(Error::Validation(
                "runOnDemand can only be used when source is 'publisher'".to_string(),
            ));
        }

        if !self.fallback.is_empty()
            && !self.fallback.starts_with("rtsp://")
            && !self.fallback.starts_with("rtsps://")
            && validate_path_name(&self.fallback).is_err()
        {
            return Err(Error::Validation(format!(
                "invalid fallback '{}'",
                self.fallback
            )));
        }

        if self.record {
            if !self.record_path.contains("%path") {
                return Err(Error::Validation(
                    "recordPath must contain %path".to_string(),
                ));
            }
            if !self.record_path.contains("%s")
                && !(self.record_path.contains("%Y") && self.record_path.contains("%S"))
            {
                return Err(Error::Validation(
                    "recordPath must contain either %s or the %Y...%S time directives"
                        .to_string(),
                ));
            }
            if self.record_segment_duration.is_zero() {
                return Err(Error::Validation(
                    "recordSegmentDuration must be greater than zero".to_string(),
                ));
            }
        }

        match self.rtsp_transport.as_str() {
            "automatic" | "udp" | "multicast" | "tcp" => {}
            other => {
                return Err(Error::Validation(format!(
                    "invalid rtspTransport '{other}'"
                )));
            }
        }

        Ok(())
    }
}

/// Literal path names: non-empty, restricted charset, balanced slashes.
/// Regex templates (leading `~`) must compile.
pub fn validate_path_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("path name can not be empty".to_string()));
    }

    if let Some(expr) = name.strip_prefix('~') {
        regex::Regex::new(expr)
            .map_err(|e| Error::Validation(format!("invalid path regex '{expr}': {e}")))?;
        return Ok(());
    }

    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(Error::Validation(format!(
            "path name '{name}' can not begin or end with a slash"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
    {
        return Err(Error::Validation(format!(
            "path name '{name}' contains forbidden characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        PathConf::default().validate("mypath").unwrap();
    }

    #[test]
    fn test_path_name_validation() {
        assert!(validate_path_name("cam1").is_ok());
        assert!(validate_path_name("cams/front/door").is_ok());
        assert!(validate_path_name("~^cam[0-9]+$").is_ok());
        assert!(validate_path_name("").is_err());
        assert!(validate_path_name("/cam").is_err());
        assert!(validate_path_name("cam/").is_err());
        assert!(validate_path_name("a//b").is_err());
        assert!(validate_path_name("cam 1").is_err());
        assert!(validate_path_name("~[").is_err());
    }

    #[test]
    fn test_source_validation() {
        let mut conf = PathConf {
            source: "rtsp://127.0.0.1:8554/stream".to_string(),
            ..PathConf::default()
        };
        conf.validate("p").unwrap();

        conf.source = "ftp://example.com/x".to_string();
        assert!(conf.validate("p").is_err());

        conf.source = "not a url".to_string();
        assert!(conf.validate("p").is_err());
    }

    #[test]
    fn test_on_demand_constraints() {
        let conf = PathConf {
            source_on_demand: true,
            ..PathConf::default()
        };
        assert!(conf.validate("p").is_err());

        let conf = PathConf {
            source: "rtsp://127.0.0.1:8554/s".to_string(),
            source_on_demand: true,
            ..PathConf::default()
        };
        conf.validate("p").unwrap();
        assert!(conf.is_on_demand());

        let conf = PathConf {
            source: "rtsp://127.0.0.1:8554/s".to_string(),
            run_on_demand: "ffmpeg ...".to_string(),
            ..PathConf::default()
        };
        assert!(conf.validate("p").is_err());
    }

    #[test]
    fn test_record_path_validation() {
        let conf = PathConf {
            record: true,
            record_path: "./rec/no-tokens".to_string(),
            ..PathConf::default()
        };
        assert!(conf.validate("p").is_err());

        let conf = PathConf {
            record: true,
            ..PathConf::default()
        };
        conf.validate("p").unwrap();
    }

    #[test]
    fn test_patch_unknown_field_rejected() {
        let conf = PathConf::default();
        let err = conf
            .patched_with(&serde_json::json!({"test": "x"}))
            .unwrap_err();
        assert_eq!(err.to_string(), "json: unknown field \"test\"");
    }

    #[test]
    fn test_patch_merges_fields() {
        let conf = PathConf::default();
        let patched = conf
            .patched_with(&serde_json::json!({
                "source": "rtsp://127.0.0.1:9999/mypath",
                "sourceOnDemand": true,
                "rpiCameraVFlip": true,
            }))
            .unwrap();
        assert_eq!(patched.source, "rtsp://127.0.0.1:9999/mypath");
        assert!(patched.source_on_demand);
        assert!(patched.rpi_camera_v_flip);
        // untouched fields keep their previous values
        assert_eq!(patched.record_format, RecordFormat::Fmp4);
    }
}
