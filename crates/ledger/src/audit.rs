use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    pub user_id: String,
    pub invoice_id: String,
    pub invoice_hash: Option<String>,
    pub prev_hash: Option<String>,
    pub transmission_id: Option<String>,
    pub state: String,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str, user_id: &str, invoice_id: &str, state: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            user_id: user_id.to_string(),
            invoice_id: invoice_id.to_string(),
            invoice_hash: None,
            prev_hash: None,
            transmission_id: None,
            state: state.to_string(),
            error: None,
        }
    }

    pub fn with_link(mut self, prev_hash: String, hash: String) -> Self {
        self.prev_hash = Some(prev_hash);
        self.invoice_hash = Some(hash);
        self
    }

    pub fn with_transmission_id(mut self, transmission_id: Option<String>) -> Self {
        self.transmission_id = transmission_id;
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Append-only JSONL audit trail. A log without a path drops events.
#[derive(Clone, Default)]
pub struct AuditLog {
    path: Option<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Arc::default(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn write(&self, event: &AuditEvent) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string(event)?;

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", json)?;
        tracing::debug!(event_type=%event.event_type, invoice_id=%event.invoice_id, "Audit event written");
        Ok(())
    }

    /// Write and only log on failure; the audit trail never fails an operation.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write(&event) {
            tracing::warn!(event_type=%event.event_type, error=%e, "failed to write audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(&path);

        log.record(AuditEvent::new("invoice_chained", "u1", "INV-1", "pending"));
        log.record(
            AuditEvent::new("delivery_failed", "u1", "INV-1", "pending").with_error("boom".into()),
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].error.as_deref(), Some("boom"));
    }

    #[test]
    fn disabled_log_is_a_noop() {
        AuditLog::disabled()
            .write(&AuditEvent::new("x", "u", "i", "s"))
            .unwrap();
    }
}
