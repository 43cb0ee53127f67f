//! JSON messages exchanged on the control and telemetry channels.
//!
//! Every message is an object discriminated by its `"type"` field.

use serde::{Deserialize, Serialize};
use teleop_types::{RobotId, RobotRecord, TeleopError, VelocityCommand};

/// Outbound control-channel requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlRequest {
    /// Point the backend at the signaling server it should bridge to.
    InitBridge { url: String },
    SwitchRobot {
        #[serde(rename = "robotId")]
        robot_id: RobotId,
    },
    SwitchMode { mode: String },
}

/// Inbound control-channel events.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlEvent {
    /// The backend finished switching to `robot_id`.
    SwitchedRobot {
        #[serde(rename = "robotId")]
        robot_id: RobotId,
    },
    /// Full replacement of the roster.
    UpdateRobots {
        #[serde(default)]
        robots: Vec<RobotRecord>,
    },
}

/// Outbound telemetry-channel requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TelemetryRequest {
    Command { command: VelocityCommand },
}

impl ControlEvent {
    pub fn parse(text: &str) -> Result<Self, TeleopError> {
        serde_json::from_str(text)
            .map_err(|e| TeleopError::Protocol(format!("control message: {e}")))
    }
}

pub(crate) fn to_json<T: Serialize>(message: &T) -> Result<String, TeleopError> {
    serde_json::to_string(message).map_err(|e| TeleopError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn as_value<T: Serialize>(m: &T) -> Value {
        serde_json::from_str(&to_json(m).unwrap()).unwrap()
    }

    #[test]
    fn control_requests_use_backend_field_names() {
        assert_eq!(
            as_value(&ControlRequest::InitBridge { url: "ws://sig:3002".into() }),
            json!({"type": "initBridge", "url": "ws://sig:3002"})
        );
        assert_eq!(
            as_value(&ControlRequest::SwitchRobot { robot_id: RobotId::Number(4) }),
            json!({"type": "switchRobot", "robotId": 4})
        );
        assert_eq!(
            as_value(&ControlRequest::SwitchMode { mode: "manual".into() }),
            json!({"type": "switchMode", "mode": "manual"})
        );
    }

    #[test]
    fn command_wraps_twist() {
        let v = as_value(&TelemetryRequest::Command {
            command: VelocityCommand::drive(1.0, 0.0),
        });
        assert_eq!(v["type"], "command");
        assert_eq!(v["command"]["linear"]["x"], 1.0);
        assert_eq!(v["command"]["angular"]["z"], 0.0);
    }

    #[test]
    fn parses_switched_robot_with_string_id() {
        let event = ControlEvent::parse(r#"{"type":"switchedRobot","robotId":"7"}"#).unwrap();
        assert_eq!(event, ControlEvent::SwitchedRobot { robot_id: RobotId::Number(7) });
    }

    #[test]
    fn parses_update_robots() {
        let event = ControlEvent::parse(
            r#"{"type":"updateRobots","robots":[{"id":1,"name":"a"},{"id":"b","name":"b","battery":50}]}"#,
        )
        .unwrap();
        let ControlEvent::UpdateRobots { robots } = event else {
            panic!("expected UpdateRobots");
        };
        assert_eq!(robots.len(), 2);
        assert_eq!(robots[1].battery, Some(50.0));
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let err = ControlEvent::parse(r#"{"type":"reboot"}"#).unwrap_err();
        assert!(matches!(err, TeleopError::Protocol(_)));
        assert!(ControlEvent::parse("not json").is_err());
    }
}
