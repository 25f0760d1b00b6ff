//! Recording segment discovery.
//!
//! The filesystem is the only index: every listing walks the configured
//! record directories and decodes filenames against the path's template.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;

use relaymux_core::{Conf, Error, PathConf, RecordFormat, Result};

use crate::segment_path::SegmentPathTemplate;

/// One discovered segment file.
#[derive(Debug, Clone)]
pub struct Segment {
    pub file_path: PathBuf,
    pub start: DateTime<Local>,
    pub format: RecordFormat,
}

/// Wire shape of one segment in the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentEntry {
    pub start: DateTime<Local>,
}

/// Wire shape of one recording in the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct Recording {
    pub name: String,
    pub segments: Vec<SegmentEntry>,
}

/// Walk a directory tree, collecting file paths. I/O errors prune the
/// offending branch instead of failing the listing.
fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

/// Decode every file under a template's fixed directory.
pub(crate) fn walk_decoded(
    template: &SegmentPathTemplate,
) -> Vec<(String, DateTime<Local>, PathBuf)> {
    let mut files = Vec::new();
    walk_files(Path::new(&template.fixed_dir()), &mut files);

    let mut out = Vec::new();
    for file in files {
        let Some(file_str) = file.to_str() else {
            continue;
        };
        if let Some((name, start)) = template.decode(file_str) {
            out.push((name, start, file));
        }
    }
    out
}

/// Whether a runtime path name is recorded under `conf`: literal names must
/// match exactly, regex templates must match the whole name.
fn conf_covers(conf: &PathConf, name: &str) -> bool {
    match conf.name.strip_prefix('~') {
        Some(expr) => regex::Regex::new(expr).is_ok_and(|re| re.is_match(name)),
        None => conf.name == name,
    }
}

/// All runtime path names that have at least one decodable segment on disk,
/// sorted lexicographically, duplicates collapsed.
#[must_use]
pub fn find_all_paths_with_segments(conf: &Conf) -> Vec<String> {
    let mut names = BTreeSet::new();
    for path_conf in conf.paths.values() {
        let template =
            SegmentPathTemplate::new(&path_conf.record_path, path_conf.record_format);
        for (name, _, _) in walk_decoded(&template) {
            if conf_covers(path_conf, &name) {
                names.insert(name);
            }
        }
    }
    names.into_iter().collect()
}

/// Segments of one path, ordered by decoded start time.
pub fn segments_of_path(path_conf: &PathConf, name: &str) -> Result<Vec<Segment>> {
    let template =
        SegmentPathTemplate::new(&path_conf.record_path, path_conf.record_format);

    let mut segments: Vec<Segment> = walk_decoded(&template)
        .into_iter()
        .filter(|(decoded_name, _, _)| decoded_name == name)
        .map(|(_, start, file_path)| Segment {
            file_path,
            start,
            format: path_conf.record_format,
        })
        .collect();

    if segments.is_empty() {
        return Err(Error::NotFound(format!(
            "no segments found for path '{name}'"
        )));
    }
    segments.sort_by_key(|s| s.start);
    Ok(segments)
}

/// Remove the single file whose interpolated name matches `start` exactly.
/// The next listing walk rediscovers state; no index is updated.
pub fn delete_segment(
    path_conf: &PathConf,
    name: &str,
    start: DateTime<Local>,
) -> Result<()> {
    let template =
        SegmentPathTemplate::new(&path_conf.record_path, path_conf.record_format);
    let file_path = template.encode(name, start)?;

    match fs::remove_file(&file_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
            "segment '{file_path}' not found"
        ))),
        Err(e) => Err(Error::Transport(format!(
            "can not delete '{file_path}': {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn make_conf(dir: &Path, paths: serde_json::Value) -> Conf {
        let record_path = format!("{}/%path/%Y-%m-%d_%H-%M-%S-%f", dir.display());
        let conf = Conf::from_json_value(serde_json::json!({
            "pathDefaults": {"recordPath": record_path},
            "paths": paths,
        }))
        .expect("conf");
        conf.validate().expect("valid");
        conf
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"x").expect("write");
    }

    #[test]
    fn test_enumeration_sorted_and_deduped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = make_conf(dir.path(), serde_json::json!({"p1": {}, "p2": {}}));

        touch(&dir.path().join("p2/2009-11-07_11-22-00-900000.mp4"));
        touch(&dir.path().join("p1/2008-11-07_11-22-00-500000.mp4"));
        touch(&dir.path().join("p1/2009-11-07_11-22-00-900000.mp4"));
        touch(&dir.path().join("p1/garbage.txt"));

        let names = find_all_paths_with_segments(&conf);
        assert_eq!(names, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn test_regex_paths_match_decoded_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = make_conf(dir.path(), serde_json::json!({"~^cam[0-9]+$": {}}));

        touch(&dir.path().join("cam1/2008-11-07_11-22-00-500000.mp4"));
        touch(&dir.path().join("other/2008-11-07_11-22-00-500000.mp4"));

        let names = find_all_paths_with_segments(&conf);
        assert_eq!(names, vec!["cam1".to_string()]);
    }

    #[test]
    fn test_segments_chronological() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = make_conf(dir.path(), serde_json::json!({"p1": {}}));
        let path_conf = &conf.paths["p1"];

        touch(&dir.path().join("p1/2009-11-07_11-22-00-900000.mp4"));
        touch(&dir.path().join("p1/2008-11-07_11-22-00-500000.mp4"));

        let segments = segments_of_path(path_conf, "p1").expect("segments");
        assert_eq!(segments.len(), 2);
        let expected_first = Local
            .with_ymd_and_hms(2008, 11, 7, 11, 22, 0)
            .single()
            .expect("time")
            + chrono::Duration::microseconds(500_000);
        assert_eq!(segments[0].start, expected_first);
        assert!(segments[0].start < segments[1].start);
    }

    #[test]
    fn test_segments_of_unknown_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = make_conf(dir.path(), serde_json::json!({"p1": {}}));
        assert!(matches!(
            segments_of_path(&conf.paths["p1"], "p1"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = make_conf(dir.path(), serde_json::json!({"p1": {}}));
        let path_conf = &conf.paths["p1"];

        let start = Local
            .with_ymd_and_hms(2008, 11, 7, 11, 22, 0)
            .single()
            .expect("time")
            + chrono::Duration::microseconds(500_000);
        let file = dir.path().join("p1/2008-11-07_11-22-00-500000.mp4");
        touch(&file);

        delete_segment(path_conf, "p1", start).expect("delete");
        assert!(!file.exists());

        // second delete: the file is gone
        assert!(matches!(
            delete_segment(path_conf, "p1", start),
            Err(Error::NotFound(_))
        ));
    }
}
