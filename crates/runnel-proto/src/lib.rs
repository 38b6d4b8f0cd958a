//! Runnel wire types shared by the relay service and the remote agent.
//!
//! Responsibilities:
//! - command lifecycle states and their serialized names
//! - request/response bodies for the user-facing and agent-facing APIs
//! - the auth header names both sides must agree on

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header carrying the acting chat identity on user-facing calls.
pub const USER_HEADER: &str = "x-runnel-user";
/// Optional header carrying the acting user's display name.
pub const USER_NAME_HEADER: &str = "x-runnel-user-name";
/// Header carrying the machine id on agent-facing calls.
pub const MACHINE_HEADER: &str = "x-runnel-machine";

/// Lifecycle of a queued command.
///
/// Legal transitions: `Pending -> Claimed | Expired`,
/// `Claimed -> Completed | Failed`. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Claimed,
    Completed,
    Failed,
    Expired,
}

impl CommandState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Claimed => "claimed",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Failed | CommandState::Expired
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command state: {0}")]
pub struct ParseCommandStateError(pub String);

impl FromStr for CommandState {
    type Err = ParseCommandStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandState::Pending),
            "claimed" => Ok(CommandState::Claimed),
            "completed" => Ok(CommandState::Completed),
            "failed" => Ok(CommandState::Failed),
            "expired" => Ok(CommandState::Expired),
            other => Err(ParseCommandStateError(other.to_string())),
        }
    }
}

/// Poll-derived machine liveness, for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Active,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMachineRequest {
    pub name: String,
}

/// Issued once at registration; the secret is never returned again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMachineResponse {
    pub machine_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSummary {
    pub machine_id: String,
    pub name: String,
    pub status: MachineStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterScriptRequest {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptCreated {
    pub script_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCommandRequest {
    pub script_name: String,
    pub machine_id: String,
}

/// Full command record as seen by user-facing queries. `output` is the
/// verification surface for confirming a command's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandView {
    pub command_id: i64,
    pub script_name: String,
    pub target_machine_id: String,
    pub requested_by: String,
    pub state: CommandState,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// What an agent receives from the pending poll: just enough to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommand {
    pub command_id: i64,
    pub script_name: String,
    pub script_content: String,
    pub created_at: DateTime<Utc>,
}

/// Terminal result reported by the claiming agent. Exactly one of
/// `output` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReport {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub platform_user_id: String,
    pub display_name: Option<String>,
    pub is_allowed: bool,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAllowedRequest {
    pub allowed: bool,
}
