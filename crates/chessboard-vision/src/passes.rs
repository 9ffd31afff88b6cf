//! On-disk calibration passes: one directory per pass, marked complete by a
//! `.complete` sentinel file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{Error, Result};

pub const SENTINEL: &str = ".complete";
pub const SUMMARY: &str = "summary.json";
pub const METADATA: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassFile {
    pub name: String,
    pub size: u64,
    pub modified: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassInfo {
    pub pass_id: String,
    pub complete: bool,
    /// From the pass id when it carries one, else the directory mtime.
    pub timestamp: String,
    /// Sorted by name, hidden files included.
    pub files: Vec<PassFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub pass_id: String,
    pub completed_at: String,
    pub num_files: usize,
    pub files: Vec<String>,
}

fn display_time(t: SystemTime) -> String {
    OffsetDateTime::from(t)
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_default()
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// Human-readable time encoded in a pass id: `YYYYMMDD-HHMMSS`,
/// `YYYY-MM-DD-HH-MM-SS` or a 10-digit unix timestamp, in that order.
pub fn extract_timestamp(pass_id: &str) -> Option<String> {
    for pattern in [
        r"(\d{4})(\d{2})(\d{2})-(\d{2})(\d{2})(\d{2})",
        r"(\d{4})-(\d{2})-(\d{2})-(\d{2})-(\d{2})-(\d{2})",
    ] {
        let re = Regex::new(pattern).ok()?;
        if let Some(c) = re.captures(pass_id) {
            return Some(format!(
                "{}-{}-{} {}:{}:{}",
                &c[1], &c[2], &c[3], &c[4], &c[5], &c[6]
            ));
        }
    }
    let re = Regex::new(r"(\d{10})").ok()?;
    let secs: i64 = re.captures(pass_id)?[1].parse().ok()?;
    OffsetDateTime::from_unix_timestamp(secs)
        .ok()?
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .ok()
}

/// `~/.viam`, where captured data is stored by default.
pub fn viam_dot_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".viam"))
}

/// `<root>/capture/<pass_id>`, created if missing. `root` defaults to
/// [`viam_dot_dir`].
pub fn capture_dir(root: Option<&Path>, pass_id: &str) -> Result<PathBuf> {
    check_component("pass_id", pass_id)?;
    let root = match root {
        Some(r) => r.to_path_buf(),
        None => viam_dot_dir()
            .ok_or_else(|| Error::NotFound("home directory".to_string()))?,
    };
    let dir = root.join("capture").join(pass_id);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Single path component: not `.` or `..` and free of separators. Names
/// such as `v1..2` are fine.
fn check_component(kind: &'static str, value: &str) -> Result<()> {
    if matches!(value, "" | "." | "..") || value.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidAttribute {
            name: kind,
            reason: format!("{value:?} is not a plain name"),
        });
    }
    Ok(())
}

fn list_files(dir: &Path) -> Result<Vec<PassFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        files.push(PassFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
            modified: meta.modified().map(display_time).unwrap_or_default(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[derive(Debug, Clone)]
pub struct PassStore {
    base_dir: PathBuf,
}

impl PassStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn pass_dir(&self, pass_id: &str) -> Result<PathBuf> {
        check_component("pass_id", pass_id)?;
        Ok(self.base_dir.join(pass_id))
    }

    pub fn file_path(&self, pass_id: &str, filename: &str) -> Result<PathBuf> {
        check_component("filename", filename)?;
        Ok(self.pass_dir(pass_id)?.join(filename))
    }

    pub fn exists(&self, pass_id: &str) -> bool {
        self.pass_dir(pass_id).is_ok_and(|d| d.is_dir())
    }

    pub fn is_complete(&self, pass_id: &str) -> bool {
        self.pass_dir(pass_id)
            .is_ok_and(|d| d.join(SENTINEL).exists())
    }

    pub fn save_file(&self, pass_id: &str, filename: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.file_path(pass_id, filename)?;
        fs::create_dir_all(self.pass_dir(pass_id)?)?;
        fs::write(&path, data)?;
        info!(path = %path.display(), bytes = data.len(), "saved file");
        Ok(path)
    }

    /// Writes the `.complete` sentinel: `completed_at` plus `metadata`.
    pub fn mark_pass_complete(&self, pass_id: &str, metadata: Option<&Map<String, Value>>) -> Result<()> {
        let dir = self.pass_dir(pass_id)?;
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("Pass directory does not exist: {pass_id}")));
        }
        let mut sentinel = Map::new();
        sentinel.insert("completed_at".to_string(), Value::String(now_rfc3339()));
        if let Some(extra) = metadata {
            sentinel.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        fs::write(dir.join(SENTINEL), serde_json::to_vec_pretty(&sentinel)?)?;
        info!(pass_id, "marked pass as complete");
        Ok(())
    }

    pub fn pass_info(&self, pass_id: &str) -> Result<PassInfo> {
        let dir = self.pass_dir(pass_id)?;
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("pass {pass_id}")));
        }
        let timestamp = extract_timestamp(pass_id).unwrap_or_else(|| {
            fs::metadata(&dir)
                .and_then(|m| m.created().or_else(|_| m.modified()))
                .map(display_time)
                .unwrap_or_default()
        });
        Ok(PassInfo {
            pass_id: pass_id.to_string(),
            complete: dir.join(SENTINEL).exists(),
            timestamp,
            files: list_files(&dir)?,
        })
    }

    /// Every pass, newest id first.
    pub fn list_passes(&self) -> Result<Vec<PassInfo>> {
        let mut passes = Vec::new();
        if !self.base_dir.is_dir() {
            return Ok(passes);
        }
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.pass_info(&id) {
                Ok(info) => passes.push(info),
                Err(err) => warn!(pass_id = %id, %err, "skipping unreadable pass directory"),
            }
        }
        passes.sort_by(|a, b| b.pass_id.cmp(&a.pass_id));
        Ok(passes)
    }

    /// Writes `summary.json` into the pass and returns it. Hidden files such
    /// as the `.complete` sentinel are not counted.
    pub fn write_summary(&self, pass_id: &str) -> Result<PassSummary> {
        let dir = self.pass_dir(pass_id)?;
        let files: Vec<String> = list_files(&dir)?
            .into_iter()
            .map(|f| f.name)
            .filter(|name| !name.starts_with('.'))
            .collect();
        let summary = PassSummary {
            pass_id: pass_id.to_string(),
            completed_at: now_rfc3339(),
            num_files: files.len(),
            files,
        };
        let path = dir.join(SUMMARY);
        fs::write(&path, serde_json::to_vec_pretty(&summary)?)?;
        info!(path = %path.display(), "created summary");
        Ok(summary)
    }

    /// Contents of `metadata.json`, if the pass has one.
    pub fn metadata(&self, pass_id: &str) -> Result<Option<Value>> {
        let path = self.file_path(pass_id, METADATA)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_from_pass_ids() {
        assert_eq!(
            extract_timestamp("pass-20241109-143022").as_deref(),
            Some("2024-11-09 14:30:22")
        );
        assert_eq!(
            extract_timestamp("pass-2024-11-09-14-30-22").as_deref(),
            Some("2024-11-09 14:30:22")
        );
        assert_eq!(
            extract_timestamp("pass-1699545022").as_deref(),
            Some("2023-11-09 15:50:22")
        );
        assert_eq!(extract_timestamp("warmup"), None);
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassStore::new(dir.path()).unwrap();
        assert!(store.save_file("..", "x", b"").is_err());
        assert!(store.save_file("p", "../x", b"").is_err());
        assert!(store.save_file("p/q", "x", b"").is_err());
        assert!(store.save_file("p", "", b"").is_err());
    }

    #[test]
    fn save_complete_list_and_summarize() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassStore::new(dir.path().join("passes")).unwrap();
        store.save_file("pass-20241109-143022", "img0.png", b"abc").unwrap();
        store.save_file("pass-20241109-143022", "poses.json", b"{}").unwrap();
        store.save_file("pass-20241110-090000", "img0.png", b"x").unwrap();
        assert!(!store.is_complete("pass-20241109-143022"));

        let mut meta = Map::new();
        meta.insert("operator".to_string(), Value::String("ci".to_string()));
        store.mark_pass_complete("pass-20241109-143022", Some(&meta)).unwrap();
        assert!(store.is_complete("pass-20241109-143022"));
        let sentinel: Value = serde_json::from_slice(
            &fs::read(store.file_path("pass-20241109-143022", SENTINEL).unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(sentinel["operator"], "ci");
        assert!(sentinel["completed_at"].is_string());

        let passes = store.list_passes().unwrap();
        assert_eq!(passes.len(), 2);
        assert_eq!(passes[0].pass_id, "pass-20241110-090000");
        assert_eq!(passes[1].timestamp, "2024-11-09 14:30:22");
        assert!(passes[1].complete);
        let names: Vec<_> = passes[1].files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![".complete", "img0.png", "poses.json"]);
        assert_eq!(passes[1].files[1].size, 3);

        let summary = store.write_summary("pass-20241109-143022").unwrap();
        assert_eq!(summary.num_files, 2);
        assert_eq!(summary.files, vec!["img0.png", "poses.json"]);
        assert!(store.file_path("pass-20241109-143022", SUMMARY).unwrap().exists());
    }

    #[test]
    fn summary_skips_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassStore::new(dir.path()).unwrap();
        store.save_file("p1", "img0.png", b"a").unwrap();
        store.save_file("p1", ".DS_Store", b"junk").unwrap();
        store.mark_pass_complete("p1", None).unwrap();
        let summary = store.write_summary("p1").unwrap();
        assert_eq!(summary.files, vec!["img0.png"]);
        assert_eq!(summary.num_files, 1);

        // A second summary counts the first one, but still no dotfiles.
        let again = store.write_summary("p1").unwrap();
        assert_eq!(again.files, vec!["img0.png", SUMMARY]);
    }

    #[test]
    fn dotted_names_are_plain_components() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassStore::new(dir.path()).unwrap();
        store.save_file("v1..2", "a..b.png", b"x").unwrap();
        store.save_file("pass-2", "img.png", b"y").unwrap();
        // Legal on disk but not addressable as a pass; listing skips it.
        fs::create_dir(dir.path().join("odd\\name")).unwrap();
        assert!(store.exists("v1..2"));
        assert!(store.file_path("v1..2", "a..b.png").unwrap().is_file());

        let ids: Vec<_> = store.list_passes().unwrap().into_iter().map(|p| p.pass_id).collect();
        assert_eq!(ids, vec!["v1..2", "pass-2"]);
        for bad in ["..", ".", "a/b", "a\\b"] {
            assert!(store.pass_dir(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn completing_missing_pass_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassStore::new(dir.path()).unwrap();
        assert!(matches!(store.mark_pass_complete("nope", None), Err(Error::NotFound(_))));
    }

    #[test]
    fn capture_dir_is_created_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = capture_dir(Some(dir.path()), "pass-1").unwrap();
        assert_eq!(path, dir.path().join("capture").join("pass-1"));
        assert!(path.is_dir());
    }
}
