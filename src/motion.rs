//! Turns raw trackball counts into world-frame motion.

use crate::pose::{normalize_angle, rotate_to_world, Pose, Radian, Velocity, VerticalVelocity};
use crate::sensor_frame::SensorFrame;

/// Fixed parameters of the integrator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionConfig {
    /// Tick period in seconds
    pub dt: f64,
    /// Length units per raw encoder count
    pub counts_to_length: f64,
    /// Speed limit applied to each linear axis
    pub max_velocity: f64,
    /// Radians per raw rotation count
    pub rotation_sensitivity: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            dt: 0.05,
            counts_to_length: 0.0364,
            max_velocity: 100.0,
            rotation_sensitivity: 0.05,
        }
    }
}

/// What the integrator may do while the subject is off the walkable surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallMotion {
    /// Normal integration
    Grounded,
    /// Linear motion is frozen; rotation is frozen too when asked
    Falling {
        #[allow(missing_docs)]
        freeze_rotation: bool,
    },
}

impl FallMotion {
    fn linear_frozen(&self) -> bool {
        matches!(self, FallMotion::Falling { .. })
    }

    fn rotation_frozen(&self) -> bool {
        matches!(
            self,
            FallMotion::Falling {
                freeze_rotation: true
            }
        )
    }
}

/// Convert raw counts on one axis into a clamped velocity.
pub fn axis_velocity(counts: f64, config: &MotionConfig) -> f64 {
    let v = counts * config.counts_to_length / config.dt;
    v.clamp(-config.max_velocity, config.max_velocity)
}

/// Advance `pose` by one tick of `frame`.
///
/// Translation is rotated by the heading the pose had *before* this tick so
/// a turn and a step in the same sample do not bias each other. Position is
/// integrated with a plain Euler step.
pub fn integrate(
    pose: &Pose,
    frame: &SensorFrame,
    config: &MotionConfig,
    policy: FallMotion,
) -> (Pose, Velocity) {
    let (vx, vy) = if policy.linear_frozen() {
        (0.0, 0.0)
    } else {
        let lateral = axis_velocity(frame.lateral(), config);
        let forward = axis_velocity(frame.forward(), config);
        rotate_to_world(lateral, forward, pose.heading)
    };

    let turn = if policy.rotation_frozen() {
        0.0
    } else {
        frame.rotation() * config.rotation_sensitivity
    };

    let new_pose = Pose {
        x: pose.x + vx * config.dt,
        y: pose.y + vy * config.dt,
        height: pose.height,
        heading: normalize_angle(pose.heading + turn),
    };
    let velocity = Velocity {
        vx,
        vy,
        vz: if policy.linear_frozen() {
            VerticalVelocity::Numeric(0.0)
        } else {
            VerticalVelocity::EngineControlled
        },
        vheading: turn / config.dt,
    };
    (new_pose, velocity)
}

/// Motion command for a frontend that runs its own physics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealtimeMotion {
    /// Heading after this sample
    pub heading: Radian,
    /// Change in heading this sample
    pub delta_heading: Radian,
    /// World-frame velocity; vertical motion stays with the engine
    pub velocity: Velocity,
}

/// Heading-first update used when the frontend owns position.
///
/// The heading is advanced before the velocity is rotated so the engine sees
/// the turn in the same sample, without waiting for a position round trip.
/// While falling, linear velocity is zeroed and the heading only holds still
/// if `policy` freezes rotation.
pub fn realtime_motion(
    heading: Radian,
    frame: &SensorFrame,
    config: &MotionConfig,
    policy: FallMotion,
) -> RealtimeMotion {
    let delta_heading = if policy.rotation_frozen() {
        0.0
    } else {
        frame.rotation() * config.rotation_sensitivity
    };
    let heading = normalize_angle(heading + delta_heading);
    let (vx, vy) = if policy.linear_frozen() {
        (0.0, 0.0)
    } else {
        rotate_to_world(
            axis_velocity(frame.lateral(), config),
            axis_velocity(frame.forward(), config),
            heading,
        )
    };
    RealtimeMotion {
        heading,
        delta_heading,
        velocity: Velocity {
            vx,
            vy,
            vz: VerticalVelocity::EngineControlled,
            vheading: delta_heading / config.dt,
        },
    }
}
