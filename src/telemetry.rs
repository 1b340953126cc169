//! Signal types and the telemetry items buffered for them

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Telemetry data kind; each one is buffered in its own folder.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Spans,
    Metrics,
    Logs,
}

impl SignalType {
    pub const ALL: [SignalType; 3] = [SignalType::Spans, SignalType::Metrics, SignalType::Logs];

    /// Name of the sub-folder holding this signal's buffer files
    pub fn folder_name(&self) -> &'static str {
        match self {
            SignalType::Spans => "spans",
            SignalType::Metrics => "metrics",
            SignalType::Logs => "logs",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder_name())
    }
}

impl FromStr for SignalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spans" | "span" | "traces" => Ok(SignalType::Spans),
            "metrics" | "metric" => Ok(SignalType::Metrics),
            "logs" | "log" => Ok(SignalType::Logs),
            other => Err(format!("unknown signal type: {}", other)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
    pub service_name: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub attributes: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRACE" | "VERBOSE" => LogLevel::Trace,
            "DEBUG" => LogLevel::Debug,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" | "ERR" => LogLevel::Error,
            "FATAL" | "CRITICAL" => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TraceSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub start_time: u64,
    pub end_time: u64,
    pub service_name: String,
    pub tags: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub timestamp: u64,
    pub attributes: HashMap<String, String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: String, service_name: String) -> Self {
        Self {
            timestamp: current_timestamp(),
            level,
            message,
            service_name,
            trace_id: None,
            span_id: None,
            attributes: HashMap::new(),
        }
    }
}

impl TraceSpan {
    pub fn new(operation_name: String, service_name: String) -> Self {
        let now = current_timestamp();
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
            operation_name,
            start_time: now,
            end_time: now,
            service_name,
            tags: HashMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_span_id: String) -> Self {
        self.parent_span_id = Some(parent_span_id);
        self
    }
}

impl MetricPoint {
    pub fn new(name: String, value: f64) -> Self {
        Self {
            name,
            value,
            timestamp: current_timestamp(),
            attributes: HashMap::new(),
        }
    }
}

/// Generate a new trace ID
pub fn generate_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Generate a new span ID
pub fn generate_span_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Get current timestamp in seconds since Unix epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
