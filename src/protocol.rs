//! Messages exchanged with viewers.
//!
//! Every message is a JSON object `{type, data, requestId?, timestamp}`.
//! Replies copy the `requestId` of the request they answer; `timestamp` is
//! milliseconds since the Unix epoch when the message was built.
//!
//! Viewers use a y-up frame: their `y` is our height and their `z` is our
//! forward axis. The conversion lives here and nowhere else.

use crate::config::HardwareMode;
use crate::pose::{Pose, Velocity, VerticalVelocity};
use crate::sensor_frame::SensorFrame;
use crate::trial::Summary;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}

/// The outer shape of every inbound message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    #[allow(missing_docs)]
    pub kind: String,
    #[serde(default)]
    #[allow(missing_docs)]
    pub data: Value,
    #[serde(default)]
    #[allow(missing_docs)]
    pub request_id: Option<String>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub timestamp: Option<f64>,
}

/// `experiment_register` payload.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegisterRequest {
    #[allow(missing_docs)]
    pub experiment_id: Option<String>,
    /// Legacy clients name a script file instead of an id
    pub filename: Option<String>,
    /// Overrides layered over the server defaults
    pub config: Value,
}

/// `water_deliver` payload; missing fields use the configured pulse.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WaterRequest {
    #[allow(missing_docs)]
    pub amplitude: Option<f64>,
    #[allow(missing_docs)]
    pub duration_ms: Option<u64>,
}

/// `serial_init` payload; missing fields keep the host's serial config.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SerialRequest {
    /// Device path, or `"simulated"`
    pub port: Option<String>,
    #[allow(missing_docs)]
    pub baud_rate: Option<u32>,
}

/// `logging_start` payload.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingRequest {
    /// File name inside the log directory; a timestamped one is made up
    /// when missing
    pub filename: Option<String>,
}

/// A position in the viewer's frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerPosition {
    #[allow(missing_docs)]
    pub x: f64,
    /// Height
    pub y: f64,
    /// Forward
    pub z: f64,
    #[allow(missing_docs)]
    pub theta: f64,
}

impl From<Pose> for ViewerPosition {
    fn from(pose: Pose) -> Self {
        ViewerPosition {
            x: pose.x,
            y: pose.height,
            z: pose.y,
            theta: pose.heading,
        }
    }
}

impl From<ViewerPosition> for Pose {
    fn from(p: ViewerPosition) -> Self {
        Pose {
            x: p.x,
            y: p.z,
            height: p.y,
            heading: p.theta,
        }
        .normalized()
    }
}

/// A velocity in the viewer's frame. `y` is `null` while the viewer's
/// physics engine owns vertical motion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ViewerVelocity {
    #[allow(missing_docs)]
    pub x: f64,
    #[allow(missing_docs)]
    pub y: VerticalVelocity,
    #[allow(missing_docs)]
    pub z: f64,
    #[allow(missing_docs)]
    pub theta: f64,
}

impl From<Velocity> for ViewerVelocity {
    fn from(v: Velocity) -> Self {
        ViewerVelocity {
            x: v.vx,
            y: v.vz,
            z: v.vy,
            theta: v.vheading,
        }
    }
}

/// `position_update` payload from a viewer running its own physics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionUpdate {
    #[serde(flatten)]
    #[allow(missing_docs)]
    pub position: ViewerPosition,
    /// Last motion sequence number the viewer applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Tells the viewer to teleport the player.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetDirective {
    /// `"set"` for a teleport
    pub action: &'static str,
    /// Keep the player still until the next directive
    pub lock_movement: bool,
    #[serde(flatten)]
    #[allow(missing_docs)]
    pub position: ViewerPosition,
    #[allow(missing_docs)]
    pub velocity: ViewerVelocity,
}

/// Accepts a viewer's position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionConfirm {
    /// Always `"update"`
    pub action: &'static str,
    /// Set while the player is falling
    pub lock_movement: bool,
    #[serde(flatten)]
    #[allow(missing_docs)]
    pub update: PositionUpdate,
}

impl PositionConfirm {
    #[allow(missing_docs)]
    pub fn new(update: PositionUpdate, lock_movement: bool) -> Self {
        PositionConfirm {
            action: "update",
            lock_movement,
            update,
        }
    }
}

/// Answer to a `position_update`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PositionReply {
    /// The position was accepted as is.
    Confirm(PositionConfirm),
    /// The viewer must move the player.
    Reset(ResetDirective),
}

/// Motion pushed to viewers that run their own physics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionMessage {
    /// Increases by one per message within a session
    pub seq: u64,
    #[allow(missing_docs)]
    pub velocity: ViewerVelocity,
    /// Heading change this sample, radians
    pub delta_theta: f64,
    /// Heading after this sample
    pub theta: f64,
    /// Hardware timestamp of the sample
    pub timestamp: u64,
}

/// `serial_data` payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SerialData {
    /// From a frontend-authoritative session
    Motion(MotionMessage),
    /// Straight off the shared trackball while no session consumes it
    Raw(SensorFrame),
}

/// Where the player is and how it moves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlayerState {
    #[allow(missing_docs)]
    pub position: ViewerPosition,
    #[allow(missing_docs)]
    pub velocity: ViewerVelocity,
}

/// Trial counters and flags as shown to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    #[allow(missing_docs)]
    pub trial_number: u32,
    #[allow(missing_docs)]
    pub num_rewards: u32,
    #[allow(missing_docs)]
    pub fall_count: u32,
    #[allow(missing_docs)]
    pub is_active: bool,
    #[allow(missing_docs)]
    pub is_falling: bool,
    #[allow(missing_docs)]
    pub is_trial_start: bool,
    #[allow(missing_docs)]
    pub is_trial_end: bool,
    /// Seconds since the session started
    pub elapsed_time: f64,
}

/// Render-ready state of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[allow(missing_docs)]
    pub experiment_id: String,
    #[allow(missing_docs)]
    pub player: PlayerState,
    #[allow(missing_docs)]
    pub experiment: ExperimentStatus,
    #[serde(rename = "serial_connected")]
    #[allow(missing_docs)]
    pub serial_connected: bool,
    /// `"running"` or `"stopped"`
    pub state: &'static str,
}

/// `experiment_registered` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    #[allow(missing_docs)]
    pub experiment_id: String,
    #[allow(missing_docs)]
    pub hardware_mode: HardwareMode,
    #[allow(missing_docs)]
    pub state: Snapshot,
}

/// `experiment_unregistered` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unregistered {
    #[allow(missing_docs)]
    pub experiment_id: String,
    #[allow(missing_docs)]
    pub summary: Summary,
}

/// One entry of `experiment_list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentInfo {
    #[allow(missing_docs)]
    pub experiment_id: String,
    #[allow(missing_docs)]
    pub hardware_mode: HardwareMode,
    #[allow(missing_docs)]
    pub description: String,
}

/// `experiment_list` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentList {
    #[allow(missing_docs)]
    pub experiments: Vec<ExperimentInfo>,
    #[allow(missing_docs)]
    pub active_experiment: Option<String>,
}

/// `status_response` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    #[allow(missing_docs)]
    pub active_experiment: Option<String>,
    #[serde(rename = "serial_connected")]
    #[allow(missing_docs)]
    pub serial_connected: bool,
    #[allow(missing_docs)]
    pub viewers: usize,
    /// Shared trackball frames per second
    pub data_rate: f64,
    #[allow(missing_docs)]
    pub frames_dropped: u64,
    #[allow(missing_docs)]
    pub state: Option<Snapshot>,
}

/// `water_delivered` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaterReport {
    #[allow(missing_docs)]
    pub success: bool,
    #[allow(missing_docs)]
    pub message: String,
    /// Pulses delivered by the valve so far
    pub count: u32,
    /// Present when the cooldown was still running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<u64>,
}

/// `serial_initialized` and `serial_closed` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialStatus {
    /// Reader description, e.g. `/dev/ttyACM0 @ 115200`
    pub port: String,
    /// `"open"` or `"closed"`
    pub status: &'static str,
}

/// `logging_started` and `logging_stopped` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingReport {
    #[allow(missing_docs)]
    pub path: String,
    /// Frames written so far
    pub rows: u64,
}

/// An error sent back to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[allow(missing_docs)]
    pub error: String,
    #[allow(missing_docs)]
    pub code: &'static str,
    /// Names the running session when that is why the request failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_experiment: Option<String>,
}

/// Everything the host sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Outbound {
    Pong(Value),
    ExperimentRegistered(Registered),
    ExperimentUnregistered(Unregistered),
    ExperimentList(ExperimentList),
    ExperimentState(Snapshot),
    ExperimentError(ErrorReport),
    PositionConfirm(PositionReply),
    StatusResponse(HostStatus),
    SerialData(SerialData),
    WaterDelivered(WaterReport),
    SerialInitialized(SerialStatus),
    SerialClosed(SerialStatus),
    LoggingStarted(LoggingReport),
    LoggingStopped(LoggingReport),
    Error(ErrorReport),
}

impl Outbound {
    /// Render to a JSON line, stamping the time and echoing `request_id`.
    pub fn to_json(&self, request_id: Option<&str>) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(e) => serde_json::json!({
                "type": "error",
                "data": { "error": e.to_string(), "code": "SERIALIZATION_FAILED" },
            }),
        };
        if let Value::Object(map) = &mut value {
            map.insert("timestamp".to_owned(), now_millis().into());
            if let Some(id) = request_id {
                map.insert("requestId".to_owned(), id.into());
            }
        }
        value.to_string()
    }

    /// The `error` reply for a protocol failure.
    pub fn error(code: &'static str, error: impl Into<String>) -> Self {
        Outbound::Error(ErrorReport {
            error: error.into(),
            code,
            active_experiment: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_tolerates_missing_fields() {
        let env: Envelope = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind, "ping");
        assert!(env.data.is_null());
        assert_eq!(env.request_id, None);
    }

    #[test]
    fn outbound_is_tagged_and_stamped() {
        let text = Outbound::error("UNKNOWN_MESSAGE_TYPE", "nope").to_json(Some("r1"));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "UNKNOWN_MESSAGE_TYPE");
        assert_eq!(value["requestId"], "r1");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
        assert!(value["data"].get("activeExperiment").is_none());
    }

    #[test]
    fn viewer_axes_swap_height_and_forward() {
        let pose = Pose {
            x: 1.0,
            y: 20.0,
            height: 0.5,
            heading: 0.25,
        };
        let viewer = ViewerPosition::from(pose);
        assert_eq!((viewer.x, viewer.y, viewer.z), (1.0, 0.5, 20.0));
        assert_eq!(Pose::from(viewer), pose);
    }

    #[test]
    fn reset_directive_shape() {
        let reply = PositionReply::Reset(ResetDirective {
            action: "set",
            lock_movement: false,
            position: ViewerPosition {
                x: 0.0,
                y: 0.5,
                z: 0.0,
                theta: 0.0,
            },
            velocity: Velocity::at_rest().into(),
        });
        let value = serde_json::to_value(reply).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "set",
                "lockMovement": false,
                "x": 0.0, "y": 0.5, "z": 0.0, "theta": 0.0,
                "velocity": { "x": 0.0, "y": null, "z": 0.0, "theta": 0.0 },
            })
        );
    }

    #[test]
    fn confirm_carries_the_movement_lock() {
        let update = PositionUpdate {
            position: ViewerPosition {
                x: 0.0,
                y: 0.1,
                z: 1.0,
                theta: 0.0,
            },
            seq: Some(4),
        };
        let value = serde_json::to_value(PositionReply::Confirm(PositionConfirm::new(update, true)))
            .unwrap();
        assert_eq!(
            value,
            json!({
                "action": "update",
                "lockMovement": true,
                "x": 0.0, "y": 0.1, "z": 1.0, "theta": 0.0,
                "seq": 4,
            })
        );
    }

    #[test]
    fn position_update_reads_flat_fields() {
        let update: PositionUpdate =
            serde_json::from_value(json!({"x": 1.0, "y": 0.4, "z": 3.0, "theta": 0.1, "seq": 9}))
                .unwrap();
        assert_eq!(update.position.z, 3.0);
        assert_eq!(update.seq, Some(9));
    }
}
