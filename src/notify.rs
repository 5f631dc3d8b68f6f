// src/notify.rs

//! Error reporting to maintainers.
//!
//! Delivery is a collaborator concern; the default sink writes reports to the
//! tracing output and the structured event log so they land in the cycle's
//! main log. A mail- or chat-backed implementation plugs in via the trait.

use serde_json::{json, Map};
use std::sync::Arc;
use tracing::error;

use crate::logs::BuildLogger;

/// Notification sink for maintainer-facing error reports
pub trait Notifier: Send + Sync {
    fn report(&self, pkgbase: Option<&str>, subject: &str, body: &str);
}

/// Default sink: tracing + the structured event log
pub struct LogNotifier {
    maintainer: String,
    logger: Option<Arc<BuildLogger>>,
}

impl LogNotifier {
    pub fn new(maintainer: String, logger: Option<Arc<BuildLogger>>) -> Self {
        Self { maintainer, logger }
    }
}

impl Notifier for LogNotifier {
    fn report(&self, pkgbase: Option<&str>, subject: &str, body: &str) {
        match pkgbase {
            Some(pkg) => error!(pkgbase = pkg, "{}: {}", subject, body),
            None => error!("{}: {}", subject, body),
        }
        if let Some(logger) = &self.logger {
            let mut fields = Map::new();
            fields.insert("maintainer".into(), json!(self.maintainer));
            fields.insert("pkgbase".into(), json!(pkgbase));
            fields.insert("subject".into(), json!(subject));
            fields.insert("body".into(), json!(body));
            logger.event("error-report", fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lands_in_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(BuildLogger::open(dir.path()).unwrap());
        let notifier = LogNotifier::new("maint".to_string(), Some(logger));

        notifier.report(Some("pkga"), "build failure", "it broke");

        let text = std::fs::read_to_string(dir.path().join(crate::logs::EVENT_LOG)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["event"], "error-report");
        assert_eq!(parsed["pkgbase"], "pkga");
        assert_eq!(parsed["maintainer"], "maint");
    }
}
