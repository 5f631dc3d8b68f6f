// src/logs.rs

//! Cycle logging: the append-only human log, the newline-delimited JSON event
//! log, and the per-cycle log directory handed to builders.
//!
//! Both logs are written from the driver thread and from workers; appends go
//! through a mutex so concurrent lines never interleave.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;

/// Name of the human-readable append-only log
pub const BUILD_LOG: &str = "build.log";
/// Name of the structured event log (one JSON object per line)
pub const EVENT_LOG: &str = "build-log.json";
/// Per-cycle main log inside the cycle's log directory
pub const MAIN_LOG: &str = "banquet-main.log";

/// Shared sink for the human log and the event log
pub struct BuildLogger {
    human: Mutex<File>,
    events: Mutex<File>,
}

impl BuildLogger {
    /// Open (appending) both logs under the working directory
    pub fn open(mydir: &Path) -> Result<Self> {
        let human = OpenOptions::new()
            .create(true)
            .append(true)
            .open(mydir.join(BUILD_LOG))?;
        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(mydir.join(EVENT_LOG))?;
        Ok(Self {
            human: Mutex::new(human),
            events: Mutex::new(events),
        })
    }

    /// Append one timestamped line to the human log
    pub fn line(&self, message: &str) {
        let stamp = Utc::now().to_rfc3339();
        if let Ok(mut file) = self.human.lock() {
            let _ = writeln!(file, "[{}] {}", stamp, message);
        }
    }

    /// Append one structured event; `fields` are merged into the envelope
    pub fn event(&self, event: &str, fields: Map<String, Value>) {
        let mut object = Map::new();
        object.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        object.insert("event".into(), json!(event));
        object.insert("logger_name".into(), json!("banquet"));
        for (key, value) in fields {
            object.insert(key, value);
        }
        if let Ok(mut file) = self.events.lock() {
            if let Ok(text) = serde_json::to_string(&Value::Object(object)) {
                let _ = writeln!(file, "{}", text);
            }
        }
    }
}

/// Fields common to all build events
pub fn build_event_fields(
    pkgbase: &str,
    nv_version: Option<&str>,
    pkg_version: Option<&str>,
    elapsed: f64,
) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("pkgbase".into(), json!(pkgbase));
    fields.insert("nv_version".into(), json!(nv_version));
    fields.insert("pkg_version".into(), json!(pkg_version));
    fields.insert("elapsed".into(), json!(elapsed));
    fields
}

/// The per-cycle log directory `<mydir>/log/<ISO-8601>/`
pub struct LogDir {
    dir: PathBuf,
}

impl LogDir {
    pub fn create(mydir: &Path) -> Result<Self> {
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S");
        let dir = mydir.join("log").join(stamp.to_string());
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// The cycle's main log file
    pub fn main_log(&self) -> PathBuf {
        self.dir.join(MAIN_LOG)
    }

    /// The per-package build log for this cycle
    pub fn pkg_log(&self, pkgbase: &str) -> PathBuf {
        self.dir.join(format!("{}.log", pkgbase))
    }
}

/// Point stdout and stderr at the cycle's main log.
///
/// Must happen before any worker starts so subprocess output of builds cannot
/// interleave with the controlling terminal.
pub fn redirect_std_streams(path: &Path) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let fd = file.as_raw_fd();
    for target in [1, 2] {
        nix::unistd::dup2(fd, target)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let logger = BuildLogger::open(dir.path()).unwrap();
        logger.line("first");
        logger.line("second");

        let text = std::fs::read_to_string(dir.path().join(BUILD_LOG)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }

    #[test]
    fn test_event_log_shape() {
        let dir = tempfile::tempdir().unwrap();
        let logger = BuildLogger::open(dir.path()).unwrap();
        logger.event(
            "build-successful",
            build_event_fields("pkga", Some("1.1"), Some("1.1-1"), 12.5),
        );

        let text = std::fs::read_to_string(dir.path().join(EVENT_LOG)).unwrap();
        let parsed: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["event"], "build-successful");
        assert_eq!(parsed["logger_name"], "banquet");
        assert_eq!(parsed["pkgbase"], "pkga");
        assert_eq!(parsed["nv_version"], "1.1");
        assert_eq!(parsed["elapsed"], 12.5);
        assert!(parsed["timestamp"].is_string());
    }

    #[test]
    fn test_log_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let logdir = LogDir::create(dir.path()).unwrap();
        assert!(logdir.path().starts_with(dir.path().join("log")));
        assert!(logdir.path().is_dir());
        assert_eq!(
            logdir.pkg_log("pkga").file_name().unwrap().to_str().unwrap(),
            "pkga.log"
        );
        assert_eq!(
            logdir.main_log().file_name().unwrap().to_str().unwrap(),
            MAIN_LOG
        );
    }
}
