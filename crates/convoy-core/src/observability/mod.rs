//! Observability - mission events appended as JSON lines.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A mission event for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub mission_id: String,
    pub work_item_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl MissionEvent {
    pub fn new(event_type: &str, mission_id: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            mission_id: mission_id.to_string(),
            work_item_id: None,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn for_item(mut self, work_item_id: &str) -> Self {
        self.work_item_id = Some(work_item_id.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Appends events to `.convoy/events.jsonl`.
pub struct EventEmitter {
    events_path: PathBuf,
}

impl EventEmitter {
    pub fn new(events_path: &Path) -> Self {
        Self {
            events_path: events_path.to_path_buf(),
        }
    }

    /// Emit an event.
    pub fn emit(&self, event: MissionEvent) -> Result<()> {
        if let Some(parent) = self.events_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)?;

        let line = serde_json::to_string(&event)?;
        writeln!(file, "{}", line)?;

        Ok(())
    }

    /// Emit, logging instead of failing.
    pub fn emit_quiet(&self, event: MissionEvent) {
        if let Err(e) = self.emit(event) {
            tracing::debug!(error = %e, path = %self.events_path.display(), "Failed to write event");
        }
    }

    /// Read recent events, oldest first.
    pub fn read_recent(&self, limit: usize) -> Vec<MissionEvent> {
        let file = match std::fs::File::open(&self.events_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let reader = BufReader::new(file);
        let mut events: Vec<MissionEvent> = reader
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        // Return last N events
        if events.len() > limit {
            events.drain(0..events.len() - limit);
        }

        events
    }

    /// Recent events of one mission.
    pub fn read_mission(&self, mission_id: &str, limit: usize) -> Vec<MissionEvent> {
        let mut events: Vec<MissionEvent> = self
            .read_recent(usize::MAX)
            .into_iter()
            .filter(|e| e.mission_id == mission_id)
            .collect();
        if events.len() > limit {
            events.drain(0..events.len() - limit);
        }
        events
    }
}
