use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Append-only JSONL record of session events. Tokens are never written.
pub struct Journal {
    run_id: String,
    file: File,
}

#[derive(Serialize)]
struct Event<'a> {
    ts: DateTime<Utc>,
    run_id: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(flatten)]
    data: serde_json::Value,
}

impl Journal {
    pub fn open(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open journal {}", path.display()))?;

        Ok(Self {
            run_id: run_id.to_string(),
            file,
        })
    }

    pub fn log(&mut self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let event = Event {
            ts: Utc::now(),
            run_id: &self.run_id,
            event_type,
            data,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn login(&mut self, role_id: Option<u8>, expires_at: Option<i64>) -> Result<()> {
        self.log(
            "login",
            serde_json::json!({ "role_id": role_id, "expires_at": expires_at }),
        )
    }

    pub fn logout(&mut self, had_session: bool) -> Result<()> {
        self.log("logout", serde_json::json!({ "had_session": had_session }))
    }

    /// `checkpoint` is where the expiry was noticed: "startup" or "fetch"
    pub fn session_expired(&mut self, checkpoint: &str, expires_at: i64) -> Result<()> {
        self.log(
            "session_expired",
            serde_json::json!({ "checkpoint": checkpoint, "expires_at": expires_at }),
        )
    }

    pub fn request(&mut self, method: &str, url: &str, authorized: bool) -> Result<()> {
        self.log(
            "request",
            serde_json::json!({
                "method": method,
                "url": url,
                "authorized": authorized,
            }),
        )
    }

    pub fn response(&mut self, url: &str, status: u16, duration_ms: u64) -> Result<()> {
        self.log(
            "response",
            serde_json::json!({
                "url": url,
                "status": status,
                "duration_ms": duration_ms,
            }),
        )
    }

    pub fn transport_error(&mut self, url: &str, error: &str) -> Result<()> {
        self.log(
            "transport_error",
            serde_json::json!({ "url": url, "error": error }),
        )
    }

    pub fn guard_decision(&mut self, view: &str, allowed: bool) -> Result<()> {
        self.log(
            "guard_decision",
            serde_json::json!({ "view": view, "allowed": allowed }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_events(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_journal_appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("journal.jsonl");

        let mut journal = Journal::open(&path, "run-1").unwrap();
        journal.login(Some(5), Some(1_700_000_000_000)).unwrap();
        journal
            .request("GET", "http://localhost:8080/api/student/profile", true)
            .unwrap();
        journal.logout(true).unwrap();

        let events = read_events(&path);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["type"], "login");
        assert_eq!(events[0]["run_id"], "run-1");
        assert_eq!(events[0]["role_id"], 5);
        assert_eq!(events[1]["authorized"], true);
        assert_eq!(events[2]["type"], "logout");
        assert!(events[2]["ts"].is_string());
    }

    #[test]
    fn test_journal_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        Journal::open(&path, "a")
            .unwrap()
            .session_expired("startup", 1)
            .unwrap();
        Journal::open(&path, "b")
            .unwrap()
            .guard_decision("/admin/dashboard", false)
            .unwrap();

        let events = read_events(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["checkpoint"], "startup");
        assert_eq!(events[1]["run_id"], "b");
        assert_eq!(events[1]["allowed"], false);
    }
}
