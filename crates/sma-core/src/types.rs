use serde::{Deserialize, Serialize};

/// Lifecycle states of one agent instance. `TornDown` is terminal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Disconnected,
    Connected,
    Running,
    Stopped,
    Collected,
    TornDown,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Disconnected => "disconnected",
            AgentState::Connected => "connected",
            AgentState::Running => "running",
            AgentState::Stopped => "stopped",
            AgentState::Collected => "collected",
            AgentState::TornDown => "torn_down",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Csv,
    Json,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
        }
    }
}
