use serde::{Deserialize, Serialize};
use std::fmt;

/// Attribute every control frame writes to.
pub const TRAVEL_ATTRIBUTE: &str = "w_travel";

pub const TRAVEL_CLOSED: u16 = 0;
pub const TRAVEL_OPEN: u16 = 100;
pub const TRAVEL_STOP: u16 = 101;
/// Extended travel past the regular open position.
pub const TRAVEL_CUSTOM: u16 = 200;

/// Control request for a single opener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Open,
    Close,
    Stop,
    CustomTravel,
    /// Travel to an explicit position in 0..=100
    SetPosition(u8),
}

impl ControlAction {
    /// Value written to `w_travel` in the 004 frame.
    pub fn wire_value(&self) -> String {
        match self {
            ControlAction::Open => TRAVEL_OPEN.to_string(),
            ControlAction::Close => TRAVEL_CLOSED.to_string(),
            ControlAction::Stop => TRAVEL_STOP.to_string(),
            ControlAction::CustomTravel => TRAVEL_CUSTOM.to_string(),
            ControlAction::SetPosition(position) => position.to_string(),
        }
    }

    /// Travel the opener is expected to report once the action completes.
    ///
    /// `Stop` has no target: wherever the opener halts is its terminal state.
    pub fn target_travel(&self) -> Option<u16> {
        match self {
            ControlAction::Open => Some(TRAVEL_OPEN),
            ControlAction::Close => Some(TRAVEL_CLOSED),
            ControlAction::Stop => None,
            ControlAction::CustomTravel => Some(TRAVEL_CUSTOM),
            ControlAction::SetPosition(position) => Some(u16::from(*position)),
        }
    }

    /// Whether a status report with `travel` completes this action.
    pub fn is_satisfied_by(&self, travel: Option<u16>) -> bool {
        match self.target_travel() {
            None => true,
            Some(target) => travel == Some(target),
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ControlAction::Open => write!(f, "open"),
            ControlAction::Close => write!(f, "close"),
            ControlAction::Stop => write!(f, "stop"),
            ControlAction::CustomTravel => write!(f, "custom_travel"),
            ControlAction::SetPosition(position) => write!(f, "set_position({})", position),
        }
    }
}
