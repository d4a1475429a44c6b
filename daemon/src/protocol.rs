//! Tool-call protocol (JSON messages)
//!
//! Requests name one of a closed set of read-only tools; arguments travel
//! in the same object as the `tool` tag.

use crate::detector::IncidentEvent;
use crate::error::QueryError;
use serde::{Deserialize, Serialize};

fn default_count() -> i64 {
    10
}

fn default_window_minutes() -> i64 {
    10
}

fn default_mount_count() -> i64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    GetCurrentSummary,
    GetTopCpuProcesses {
        #[serde(default = "default_count")]
        n: i64,
    },
    GetTopMemoryProcesses {
        #[serde(default = "default_count")]
        n: i64,
    },
    GetSnapshotHistory {
        #[serde(default = "default_count")]
        last_n: i64,
        #[serde(default)]
        minutes_ago: Option<i64>,
        #[serde(default)]
        include_processes: bool,
    },
    AnalyzeTrends {
        #[serde(default)]
        metric: MetricSelection,
        #[serde(default = "default_window_minutes")]
        window_minutes: i64,
    },
    FindProcessHistory {
        process_name: String,
        #[serde(default)]
        pid: Option<u32>,
    },
    ListActiveIncidents,
    /// Live filesystem headroom; not read from the window.
    CheckDiskUsage {
        #[serde(default)]
        paths: Option<Vec<String>>,
        #[serde(default = "default_mount_count")]
        top_n: i64,
    },
}

impl ToolCall {
    pub const NAMES: [&'static str; 8] = [
        "get_current_summary",
        "get_top_cpu_processes",
        "get_top_memory_processes",
        "get_snapshot_history",
        "analyze_trends",
        "find_process_history",
        "list_active_incidents",
        "check_disk_usage",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::GetCurrentSummary => "get_current_summary",
            ToolCall::GetTopCpuProcesses { .. } => "get_top_cpu_processes",
            ToolCall::GetTopMemoryProcesses { .. } => "get_top_memory_processes",
            ToolCall::GetSnapshotHistory { .. } => "get_snapshot_history",
            ToolCall::AnalyzeTrends { .. } => "analyze_trends",
            ToolCall::FindProcessHistory { .. } => "find_process_history",
            ToolCall::ListActiveIncidents => "list_active_incidents",
            ToolCall::CheckDiskUsage { .. } => "check_disk_usage",
        }
    }

    /// Resolves a tool invocation by name. Unknown names are rejected
    /// before the arguments are looked at.
    pub fn from_name(name: &str, args: serde_json::Value) -> Result<Self, QueryError> {
        if !Self::NAMES.contains(&name) {
            return Err(QueryError::UnknownTool(name.to_string()));
        }
        let mut object = match args {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(QueryError::InvalidParameter {
                    name: "arguments",
                    detail: format!("expected an object, got {}", other),
                })
            }
        };
        object.insert("tool".to_string(), serde_json::Value::from(name));
        serde_json::from_value(serde_json::Value::Object(object)).map_err(|source| {
            QueryError::MalformedArguments {
                tool: name.to_string(),
                source,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSelection {
    Cpu,
    Memory,
    #[default]
    Both,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Result {
        tool: String,
        data: serde_json::Value,
    },
    /// Not enough history yet; distinct from an empty result.
    InsufficientData {
        tool: String,
        available: usize,
        required: usize,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        message: String,
    },
    Incident {
        data: IncidentEvent,
    },
}

impl Response {
    pub fn error(tool: Option<&str>, err: impl std::fmt::Display) -> Self {
        Response::Error {
            tool: tool.map(str::to_string),
            message: err.to_string(),
        }
    }
}
