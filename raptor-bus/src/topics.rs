//! Fixed topic names. Renaming any of them breaks every deployed agent.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const SERVER_START: &str = "server.start";
pub const SERVER_STOP: &str = "server.stop";
pub const SERVER_RESTART: &str = "server.restart";
pub const SERVER_BACKUP: &str = "server.backup";
pub const SERVER_STATUS: &str = "server.status";

/// Every command topic, in the order an agent subscribes to them.
pub const COMMAND_TOPICS: [&str; 4] = [SERVER_START, SERVER_STOP, SERVER_RESTART, SERVER_BACKUP];

/// Lifecycle intent carried by a command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Start,
    Stop,
    Restart,
    Backup,
}

impl CommandAction {
    pub const ALL: [CommandAction; 4] = [
        CommandAction::Start,
        CommandAction::Stop,
        CommandAction::Restart,
        CommandAction::Backup,
    ];

    pub fn topic(self) -> &'static str {
        match self {
            CommandAction::Start => SERVER_START,
            CommandAction::Stop => SERVER_STOP,
            CommandAction::Restart => SERVER_RESTART,
            CommandAction::Backup => SERVER_BACKUP,
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic {
            SERVER_START => Some(CommandAction::Start),
            SERVER_STOP => Some(CommandAction::Stop),
            SERVER_RESTART => Some(CommandAction::Restart),
            SERVER_BACKUP => Some(CommandAction::Backup),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandAction::Start => "start",
            CommandAction::Stop => "stop",
            CommandAction::Restart => "restart",
            CommandAction::Backup => "backup",
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(CommandAction::Start),
            "stop" => Ok(CommandAction::Stop),
            "restart" => Ok(CommandAction::Restart),
            "backup" => Ok(CommandAction::Backup),
            other => Err(format!("unknown action: {other}")),
        }
    }
}
