//! Metrics tracking for the sync server

use chrono::{DateTime, Local};
use std::collections::VecDeque;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Activation,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Activation => "ACT",
        }
    }
}

/// Server metrics
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// Listen address, once bound
    pub listen_addr: Option<String>,

    /// Accepted origins, for display
    pub allowed_origins: String,

    /// Nominal loop length
    pub loop_duration_secs: f64,

    /// Currently connected viewers
    pub active_viewers: usize,

    /// Total viewers since start
    pub total_viewers: u64,

    /// Peak simultaneous viewers
    pub peak_viewers: usize,

    /// Activations counted / dropped by the debounce window
    pub activations_accepted: u64,
    pub activations_debounced: u64,

    /// Connected viewers (for display)
    pub viewer_list: Vec<ViewerInfo>,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Server status
    pub status: ServerStatus,
}

#[derive(Clone)]
pub struct ViewerInfo {
    pub viewer_id: String,
    pub color: String,
    pub connected_at: DateTime<Local>,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            listen_addr: None,
            allowed_origins: String::new(),
            loop_duration_secs: 0.0,
            active_viewers: 0,
            total_viewers: 0,
            peak_viewers: 0,
            activations_accepted: 0,
            activations_debounced: 0,
            viewer_list: Vec::new(),
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Record a newly registered viewer
    pub fn viewer_connected(&mut self, viewer_id: &str, color: &str) {
        if self.viewer_list.iter().any(|v| v.viewer_id == viewer_id) {
            return;
        }

        self.active_viewers += 1;
        self.total_viewers += 1;
        if self.active_viewers > self.peak_viewers {
            self.peak_viewers = self.active_viewers;
        }

        self.viewer_list.push(ViewerInfo {
            viewer_id: viewer_id.to_string(),
            color: color.to_string(),
            connected_at: Local::now(),
        });

        self.log(LogLevel::Connection, format!("Connected: {} ({})", viewer_id, color));
    }

    /// Record a disconnection (only if the viewer was tracked)
    pub fn viewer_disconnected(&mut self, viewer_id: &str) {
        let Some(index) = self.viewer_list.iter().position(|v| v.viewer_id == viewer_id) else {
            return;
        };

        self.viewer_list.remove(index);
        self.active_viewers = self.active_viewers.saturating_sub(1);
        self.log(LogLevel::Connection, format!("Disconnected: {}", viewer_id));
    }

    pub fn activation_accepted(&mut self, viewer_id: &str, total: u64) {
        self.activations_accepted += 1;
        self.log(LogLevel::Activation, format!("Activation by {} (total {})", viewer_id, total));
    }

    pub fn activation_debounced(&mut self) {
        self.activations_debounced += 1;
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        format_uptime(duration.num_seconds())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn format_uptime(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    }
}
