//! World-frame position and velocity of the animal's avatar.
//!
//! The world frame used throughout the crate is: `x` lateral, `y` forward
//! along the maze, `height` vertical. Heading is measured counter-clockwise
//! from the `+y` axis and is always kept in (−π, π].

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A heading in radians.
pub type Radian = f64;

/// Map any finite angle into (−π, π].
pub fn normalize_angle(theta: Radian) -> Radian {
    if !theta.is_finite() {
        return 0.0;
    }
    let mut wrapped = theta % (2.0 * PI);
    if wrapped <= -PI {
        wrapped += 2.0 * PI;
    } else if wrapped > PI {
        wrapped -= 2.0 * PI;
    }
    wrapped
}

/// Rotate a body-frame vector (lateral, forward) into the world frame.
pub fn rotate_to_world(lateral: f64, forward: f64, heading: Radian) -> (f64, f64) {
    let (sin, cos) = heading.sin_cos();
    (lateral * cos - forward * sin, lateral * sin + forward * cos)
}

/// Position and orientation of the subject.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    /// Lateral position
    pub x: f64,
    /// Forward position, the axis trials are measured along
    pub y: f64,
    /// Vertical position
    pub height: f64,
    /// Orientation, normalized to (−π, π]
    pub heading: Radian,
}

impl Pose {
    /// A pose at the given coordinates facing along `+y`.
    pub fn at(x: f64, y: f64, height: f64) -> Self {
        Pose {
            x,
            y,
            height,
            heading: 0.0,
        }
    }

    /// Copy of this pose with its heading normalized.
    pub fn normalized(self) -> Self {
        Pose {
            heading: normalize_angle(self.heading),
            ..self
        }
    }
}

/// Who is in charge of vertical motion.
///
/// Exactly one authority owns the vertical axis at a time. When a physics
/// engine owns it this serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum VerticalVelocity {
    /// An external physics engine integrates gravity and jumps
    #[default]
    EngineControlled,
    /// This process dictates the vertical velocity
    Numeric(f64),
}

impl VerticalVelocity {
    /// The numeric value, if this process owns the axis.
    pub fn value(&self) -> Option<f64> {
        match self {
            VerticalVelocity::EngineControlled => None,
            VerticalVelocity::Numeric(v) => Some(*v),
        }
    }
}

impl Serialize for VerticalVelocity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VerticalVelocity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<f64>::deserialize(deserializer)? {
            Some(v) => VerticalVelocity::Numeric(v),
            None => VerticalVelocity::EngineControlled,
        })
    }
}

/// Velocity derived each tick, never stored across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    /// Lateral world velocity
    pub vx: f64,
    /// Forward world velocity
    pub vy: f64,
    /// Vertical velocity and its owner
    pub vz: VerticalVelocity,
    /// Angular velocity in radians per second
    pub vheading: f64,
}

impl Velocity {
    /// Zero velocity that leaves vertical motion to the physics engine.
    pub fn at_rest() -> Self {
        Velocity::default()
    }

    /// Zero velocity with vertical motion pinned by this process.
    pub fn locked() -> Self {
        Velocity {
            vz: VerticalVelocity::Numeric(0.0),
            ..Velocity::default()
        }
    }

    /// Planar speed.
    pub fn speed(&self) -> f64 {
        self.vx.hypot(self.vy)
    }
}
