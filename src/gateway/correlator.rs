//! Outstanding control commands, at most one per device.
//!
//! A command leaves the active set exactly once, with one [`CommandOutcome`].
//! Issuing a new command for a device supersedes the pending one (latest wins).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::protocol::ControlAction;

pub type CommandId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    /// A status report showed the requested terminal state
    Acked,
    TimedOut,
    Superseded,
    /// The gateway answered the 004 with a non-zero errcode
    Rejected(i64),
    /// Device deleted or bridge shut down
    Cancelled,
    /// The control frame never left the bridge
    PublishFailed,
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandOutcome::Acked => write!(f, "acked"),
            CommandOutcome::TimedOut => write!(f, "timed out"),
            CommandOutcome::Superseded => write!(f, "superseded"),
            CommandOutcome::Rejected(code) => write!(f, "rejected ({})", code),
            CommandOutcome::Cancelled => write!(f, "cancelled"),
            CommandOutcome::PublishFailed => write!(f, "publish failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutstandingCommand {
    pub command_id: CommandId,
    /// Id of the 004 frame currently carrying this command
    pub frame_id: u64,
    pub device_id: String,
    pub action: ControlAction,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub command: OutstandingCommand,
    pub outcome: CommandOutcome,
}

#[derive(Debug)]
pub struct CommandCorrelator {
    next_id: CommandId,
    timeout: Duration,
    pending: HashMap<String, OutstandingCommand>,
}

impl CommandCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: 1,
            timeout,
            pending: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, device_id: &str) -> Option<&OutstandingCommand> {
        self.pending.get(device_id)
    }

    /// Records a new command. Returns its id and the command it superseded, if any.
    pub fn issue(
        &mut self,
        device_id: &str,
        action: ControlAction,
        frame_id: u64,
        now: DateTime<Utc>,
    ) -> (CommandId, Option<Resolution>) {
        let command_id = self.next_id;
        self.next_id += 1;

        let command = OutstandingCommand {
            command_id,
            frame_id,
            device_id: device_id.to_string(),
            action,
            issued_at: now,
            deadline: now + self.timeout,
            retry_count: 0,
        };

        let superseded = self
            .pending
            .insert(device_id.to_string(), command)
            .map(|previous| Resolution {
                command: previous,
                outcome: CommandOutcome::Superseded,
            });

        (command_id, superseded)
    }

    /// Resolves the device's command if `travel` is its terminal state.
    pub fn on_report(&mut self, device_id: &str, travel: Option<u16>) -> Option<Resolution> {
        let satisfied = self
            .pending
            .get(device_id)
            .map(|command| command.action.is_satisfied_by(travel))
            .unwrap_or(false);

        if satisfied {
            self.resolve(device_id, CommandOutcome::Acked)
        } else {
            None
        }
    }

    pub fn reject(&mut self, device_id: &str, errcode: i64) -> Option<Resolution> {
        self.resolve(device_id, CommandOutcome::Rejected(errcode))
    }

    pub fn cancel(&mut self, device_id: &str) -> Option<Resolution> {
        self.resolve(device_id, CommandOutcome::Cancelled)
    }

    pub fn cancel_all(&mut self) -> Vec<Resolution> {
        let mut resolutions: Vec<Resolution> = self
            .pending
            .drain()
            .map(|(_, command)| Resolution {
                command,
                outcome: CommandOutcome::Cancelled,
            })
            .collect();
        resolutions.sort_by_key(|resolution| resolution.command.command_id);
        resolutions
    }

    /// Times out every command whose deadline is at or before `now`.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Resolution> {
        let expired: Vec<String> = self
            .pending
            .values()
            .filter(|command| command.deadline <= now)
            .map(|command| command.device_id.clone())
            .collect();

        let mut resolutions: Vec<Resolution> = expired
            .iter()
            .filter_map(|device_id| self.resolve(device_id, CommandOutcome::TimedOut))
            .collect();
        resolutions.sort_by_key(|resolution| resolution.command.command_id);
        resolutions
    }

    pub fn find_by_frame(&self, frame_id: u64) -> Option<&OutstandingCommand> {
        self.pending
            .values()
            .find(|command| command.frame_id == frame_id)
    }

    /// Moves a command onto a freshly published frame after a failed publish.
    pub fn rearm(&mut self, frame_id: u64, new_frame_id: u64) -> Option<&OutstandingCommand> {
        let command = self
            .pending
            .values_mut()
            .find(|command| command.frame_id == frame_id)?;
        command.frame_id = new_frame_id;
        command.retry_count += 1;
        Some(command)
    }

    pub fn fail_publish(&mut self, frame_id: u64) -> Option<Resolution> {
        let device_id = self.find_by_frame(frame_id)?.device_id.clone();
        self.resolve(&device_id, CommandOutcome::PublishFailed)
    }

    fn resolve(&mut self, device_id: &str, outcome: CommandOutcome) -> Option<Resolution> {
        self.pending
            .remove(device_id)
            .map(|command| Resolution { command, outcome })
    }
}
