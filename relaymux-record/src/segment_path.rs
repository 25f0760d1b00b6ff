//! Recording segment filename template.
//!
//! A record path is a template containing `%path` plus strftime-style time
//! directives. Substituting the runtime path name and the segment start time
//! yields the on-disk filename; splitting a filename against the template
//! recovers both.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};

use relaymux_core::{Error, RecordFormat, Result};

/// Directives understood by the template codec.
///
/// `%f` is microseconds, zero-padded to exactly six digits. `%s` is unix
/// seconds. `%%` is a literal percent sign.
#[derive(Debug, Clone)]
pub struct SegmentPathTemplate {
    raw: String,
}

impl SegmentPathTemplate {
    /// Build from a configured record path, appending the format extension
    /// unless the template already carries it.
    #[must_use]
    pub fn new(record_path: &str, format: RecordFormat) -> Self {
        let ext = format.extension();
        let raw = if record_path.ends_with(ext) {
            record_path.to_string()
        } else {
            format!("{record_path}{ext}")
        };
        Self { raw }
    }

    /// The directory prefix that contains no template directives; the walk
    /// root for segment discovery.
    #[must_use]
    pub fn fixed_dir(&self) -> String {
        let prefix = match self.raw.find('%') {
            Some(idx) => &self.raw[..idx],
            None => &self.raw,
        };
        match prefix.rfind('/') {
            Some(idx) => prefix[..=idx].to_string(),
            None => "./".to_string(),
        }
    }

    /// Substitute the runtime path name and start time into the template.
    pub fn encode(&self, path_name: &str, start: DateTime<Local>) -> Result<String> {
        let mut out = String::with_capacity(self.raw.len() + path_name.len());
        let mut rest = self.raw.as_str();

        while let Some(idx) = rest.find('%') {
            out.push_str(&rest[..idx]);
            rest = &rest[idx + 1..];

            if let Some(after) = rest.strip_prefix("path") {
                out.push_str(path_name);
                rest = after;
                continue;
            }
            let directive = rest.chars().next().ok_or_else(|| {
                Error::Validation("record path ends with a bare '%'".to_string())
            })?;
            match directive {
                'Y' => out.push_str(&format!("{:04}", start.year())),
                'm' => out.push_str(&format!("{:02}", start.month())),
                'd' => out.push_str(&format!("{:02}", start.day())),
                'H' => out.push_str(&format!("{:02}", start.hour())),
                'M' => out.push_str(&format!("{:02}", start.minute())),
                'S' => out.push_str(&format!("{:02}", start.second())),
                'f' => out.push_str(&format!("{:06}", start.timestamp_subsec_micros())),
                's' => out.push_str(&start.timestamp().to_string()),
                '%' => out.push('%'),
                other => {
                    return Err(Error::Validation(format!(
                        "unsupported directive '%{other}' in record path"
                    )));
                }
            }
            rest = &rest[directive.len_utf8()..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Split a filename against the template; `None` when it does not match
    /// or any directive carries an invalid value.
    #[must_use]
    pub fn decode(&self, file_path: &str) -> Option<(String, DateTime<Local>)> {
        let re = self.to_regex()?;
        let caps = re.captures(file_path)?;

        let path_name = caps.name("path")?.as_str().to_string();

        let num = |name: &str| -> Option<u32> {
            caps.name(name).and_then(|m| m.as_str().parse().ok())
        };

        if let Some(unix) = caps.name("unix") {
            let secs: i64 = unix.as_str().parse().ok()?;
            let micros = num("micros").unwrap_or(0);
            let start = Local
                .timestamp_opt(secs, micros.checked_mul(1000)?)
                .single()?;
            return Some((path_name, start));
        }

        let year: i32 = caps.name("year")?.as_str().parse().ok()?;
        let start = Local
            .with_ymd_and_hms(
                year,
                num("month")?,
                num("day")?,
                num("hour")?,
                num("minute")?,
                num("second")?,
            )
            .single()?;
        let micros = num("micros").unwrap_or(0);
        let start = start + chrono::Duration::microseconds(i64::from(micros));
        Some((path_name, start))
    }

    fn to_regex(&self) -> Option<regex::Regex> {
        let mut pattern = String::from("^");
        let mut rest = self.raw.as_str();

        while let Some(idx) = rest.find('%') {
            pattern.push_str(&regex::escape(&rest[..idx]));
            rest = &rest[idx + 1..];

            if let Some(after) = rest.strip_prefix("path") {
                pattern.push_str("(?P<path>.+?)");
                rest = after;
                continue;
            }
            let (group, after) = match rest.chars().next()? {
                'Y' => ("(?P<year>\\d{4})", &rest[1..]),
                'm' => ("(?P<month>\\d{2})", &rest[1..]),
                'd' => ("(?P<day>\\d{2})", &rest[1..]),
                'H' => ("(?P<hour>\\d{2})", &rest[1..]),
                'M' => ("(?P<minute>\\d{2})", &rest[1..]),
                'S' => ("(?P<second>\\d{2})", &rest[1..]),
                'f' => ("(?P<micros>\\d{6})", &rest[1..]),
                's' => ("(?P<unix>\\d+)", &rest[1..]),
                '%' => ("%", &rest[1..]),
                _ => return None,
            };
            pattern.push_str(group);
            rest = after;
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');
        regex::Regex::new(&pattern).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> SegmentPathTemplate {
        SegmentPathTemplate::new(
            "./recordings/%path/%Y-%m-%d_%H-%M-%S-%f",
            RecordFormat::Fmp4,
        )
    }

    fn local(
        y: i32,
        mo: u32,
        d: u32,
        h: u32,
        mi: u32,
        s: u32,
        micros: u32,
    ) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
            + chrono::Duration::microseconds(i64::from(micros))
    }

    #[test]
    fn test_extension_appended_once() {
        let t = SegmentPathTemplate::new("./rec/%path/%s", RecordFormat::Mpegts);
        assert!(t.raw.ends_with(".ts"));
        let t = SegmentPathTemplate::new("./rec/%path/%s.ts", RecordFormat::Mpegts);
        assert!(!t.raw.ends_with(".ts.ts"));
    }

    #[test]
    fn test_encode() {
        let start = local(2008, 11, 7, 11, 22, 0, 500_000);
        let encoded = template().encode("p1", start).unwrap();
        assert_eq!(encoded, "./recordings/p1/2008-11-07_11-22-00-500000.mp4");
    }

    #[test]
    fn test_encode_preserves_slashes_in_path_name() {
        let start = local(2009, 1, 2, 3, 4, 5, 0);
        let encoded = template().encode("cams/front/door", start).unwrap();
        assert_eq!(
            encoded,
            "./recordings/cams/front/door/2009-01-02_03-04-05-000000.mp4"
        );
    }

    #[test]
    fn test_round_trip() {
        let start = local(2008, 11, 7, 11, 22, 0, 900_000);
        let encoded = template().encode("p1", start).unwrap();
        let (name, decoded) = template().decode(&encoded).unwrap();
        assert_eq!(name, "p1");
        assert_eq!(decoded, start);
    }

    #[test]
    fn test_decode_rejects_foreign_files() {
        assert!(template().decode("./recordings/p1/notes.txt").is_none());
        assert!(template()
            .decode("./recordings/p1/2008-11-07_11-22-00.mp4")
            .is_none());
        // month out of range
        assert!(template()
            .decode("./recordings/p1/2008-19-07_11-22-00-500000.mp4")
            .is_none());
    }

    #[test]
    fn test_unix_seconds_template() {
        let t = SegmentPathTemplate::new("./rec/%path/%s", RecordFormat::Fmp4);
        let start = local(2020, 6, 1, 12, 0, 0, 0);
        let encoded = t.encode("p1", start).unwrap();
        let (name, decoded) = t.decode(&encoded).unwrap();
        assert_eq!(name, "p1");
        assert_eq!(decoded, start);
    }

    #[test]
    fn test_fixed_dir() {
        assert_eq!(template().fixed_dir(), "./recordings/");
        let t = SegmentPathTemplate::new("/var/rec/%path/%s", RecordFormat::Fmp4);
        assert_eq!(t.fixed_dir(), "/var/rec/");
    }

    #[test]
    fn test_unsupported_directive() {
        let t = SegmentPathTemplate::new("./rec/%path/%q", RecordFormat::Fmp4);
        assert!(t.encode("p1", Local::now()).is_err());
        assert!(t.decode("./rec/p1/x.mp4").is_none());
    }
}
