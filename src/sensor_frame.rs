//! Decoder for the dual-sensor trackball stream.
//!
//! The microcontroller sends one ASCII line per sample:
//!
//! ```text
//! timestamp,A_X,A_Y,A_SQUAL,A_Surface,B_X,B_Y,B_SQUAL,B_Surface,TotalA_X,TotalA_Y,TotalB_X,TotalB_Y
//! ```
//!
//! Status and log lines are interleaved on the same stream and are reported
//! as [HardwareEvent::Status] instead of being treated as errors.

use nom::{
    bytes::complete::tag,
    character::complete::{i32, u64},
    combinator::{map, verify},
    error::{Error, ErrorKind},
    number::complete::double,
    sequence::{preceded, tuple},
    Finish, IResult,
};
use serde::Serialize;
use std::{fmt, str::FromStr};

/// Minimum number of comma separated fields in a data line.
pub const FIELD_COUNT: usize = 13;

const STATUS_MARKERS: [&str; 11] = [
    "[CMD]",
    "[CONFIG]",
    "[INFO]",
    "[START]",
    "[RUNNING]",
    "[STOP]",
    "Time(us)",
    "Data Header",
    "Data Start",
    "---",
    "===",
];

/// One optical sensor's displacement since the previous sample.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SensorReading {
    /// Raw displacement counts along the sensor's x axis
    pub dx: f64,
    /// Raw displacement counts along the sensor's y axis
    pub dy: f64,
    /// Surface quality reported by the sensor
    pub quality: i32,
    /// Whether the sensor sees the ball surface
    pub on_surface: bool,
}

/// Cumulative counts since the device started streaming.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Totals {
    #[allow(missing_docs)]
    pub left_x: f64,
    #[allow(missing_docs)]
    pub left_y: f64,
    #[allow(missing_docs)]
    pub right_x: f64,
    #[allow(missing_docs)]
    pub right_y: f64,
}

/// A single parsed hardware sample. The timestamp identifies it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SensorFrame {
    /// Device clock in microseconds
    pub timestamp: u64,
    /// Sensor A
    pub left: SensorReading,
    /// Sensor B
    pub right: SensorReading,
    /// Running totals for both sensors
    pub totals: Totals,
}

impl SensorFrame {
    /// A frame where both sensors report the same displacement, handy for
    /// driving the integrator straight.
    pub fn uniform(timestamp: u64, dx: f64, dy: f64) -> Self {
        let reading = SensorReading {
            dx,
            dy,
            quality: 0,
            on_surface: true,
        };
        SensorFrame {
            timestamp,
            left: reading,
            right: reading,
            totals: Totals::default(),
        }
    }

    /// Lateral counts, averaged across both sensors.
    pub fn lateral(&self) -> f64 {
        (self.left.dx + self.right.dx) / 2.0
    }

    /// Forward counts, averaged across both sensors.
    pub fn forward(&self) -> f64 {
        (self.left.dy + self.right.dy) / 2.0
    }

    /// Yaw counts, from the difference between the sensors.
    pub fn rotation(&self) -> f64 {
        (self.left.dx - self.right.dx) / 2.0
    }
}

/// Everything that can come down the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    /// A motion sample
    Frame(SensorFrame),
    /// Firmware chatter, headers and separators
    Status(String),
}

/// Returned when a line looks like data but cannot be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameParseError {
    /// The line had fewer than [FIELD_COUNT] fields
    TooFewFields(usize),
    /// One of the fields failed to parse
    Malformed {
        /// Unparsed rest of the line
        input: String,
        #[allow(missing_docs)]
        kind: ErrorKind,
    },
}

impl fmt::Display for FrameParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameParseError::TooFewFields(n) => {
                write!(f, "expected at least {} fields, found {}", FIELD_COUNT, n)
            }
            FrameParseError::Malformed { input, kind } => {
                write!(f, "malformed field near {:?} ({:?})", input, kind)
            }
        }
    }
}

impl std::error::Error for FrameParseError {}

fn is_status_line(line: &str) -> bool {
    !line.starts_with(|c: char| c.is_ascii_digit())
        || STATUS_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Displacement counts are always finite; `nan` and `inf` are not counts.
fn count(s: &str) -> IResult<&str, f64> {
    verify(double, |v: &f64| v.is_finite())(s)
}

fn parse_reading(s: &str) -> IResult<&str, SensorReading> {
    map(
        tuple((
            preceded(tag(","), count),
            preceded(tag(","), count),
            preceded(tag(","), i32),
            preceded(tag(","), i32),
        )),
        |(dx, dy, quality, surface)| SensorReading {
            dx,
            dy,
            quality,
            on_surface: surface != 0,
        },
    )(s)
}

fn parse_totals(s: &str) -> IResult<&str, Totals> {
    map(
        tuple((
            preceded(tag(","), count),
            preceded(tag(","), count),
            preceded(tag(","), count),
            preceded(tag(","), count),
        )),
        |(left_x, left_y, right_x, right_y)| Totals {
            left_x,
            left_y,
            right_x,
            right_y,
        },
    )(s)
}

fn parse_frame(s: &str) -> IResult<&str, SensorFrame> {
    map(
        tuple((u64, parse_reading, parse_reading, parse_totals)),
        |(timestamp, left, right, totals)| SensorFrame {
            timestamp,
            left,
            right,
            totals,
        },
    )(s)
}

impl FromStr for SensorFrame {
    type Err = FrameParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = s.split(',').count();
        if fields < FIELD_COUNT {
            return Err(FrameParseError::TooFewFields(fields));
        }
        match parse_frame(s).finish() {
            // anything after the thirteenth field is ignored
            Ok((_remaining, frame)) => Ok(frame),
            Err(Error { input, code }) => Err(FrameParseError::Malformed {
                input: input.to_string(),
                kind: code,
            }),
        }
    }
}

impl FromStr for HardwareEvent {
    type Err = FrameParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        if is_status_line(line) {
            return Ok(HardwareEvent::Status(line.to_owned()));
        }
        line.parse().map(HardwareEvent::Frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_line() {
        let s = "1523000,3,-2,41,1,-1,4.5,38,0,120,-80,-40,200\r\n";

        let event = HardwareEvent::from_str(s).unwrap();

        assert_eq!(
            event,
            HardwareEvent::Frame(SensorFrame {
                timestamp: 1523000,
                left: SensorReading {
                    dx: 3.0,
                    dy: -2.0,
                    quality: 41,
                    on_surface: true,
                },
                right: SensorReading {
                    dx: -1.0,
                    dy: 4.5,
                    quality: 38,
                    on_surface: false,
                },
                totals: Totals {
                    left_x: 120.0,
                    left_y: -80.0,
                    right_x: -40.0,
                    right_y: 200.0,
                },
            })
        );
    }

    #[test]
    fn combines_both_sensors() {
        let frame: SensorFrame = "10,4,2,0,1,2,6,0,1,0,0,0,0".parse().unwrap();
        assert_eq!(frame.lateral(), 3.0);
        assert_eq!(frame.forward(), 4.0);
        assert_eq!(frame.rotation(), 1.0);
    }

    #[test]
    fn extra_fields_are_ignored() {
        let frame: SensorFrame = "10,0,1,0,1,0,1,0,1,0,0,0,0,99,extra".parse().unwrap();
        assert_eq!(frame.timestamp, 10);
    }

    #[test]
    fn status_lines_are_not_frames() {
        for line in [
            "[INFO] sensors ready",
            "Time(us),A_X,A_Y,A_SQUAL,A_Surface,B_X,B_Y,B_SQUAL,B_Surface",
            "=== Data Start ===",
            "12 --- resync",
            "",
            "  [STOP]",
        ] {
            assert!(
                matches!(HardwareEvent::from_str(line), Ok(HardwareEvent::Status(_))),
                "{line:?} should be a status line"
            );
        }
    }

    #[test]
    fn short_lines_are_rejected() {
        assert_eq!(
            HardwareEvent::from_str("100,1,2,3"),
            Err(FrameParseError::TooFewFields(4))
        );
    }

    #[test]
    fn garbage_fields_are_rejected() {
        let res = HardwareEvent::from_str("100,1,x,3,1,0,0,0,0,0,0,0,0");
        let err = match res {
            Err(err) => err,
            Ok(event) => panic!("parsed garbage: {:?}", event),
        };
        assert!(matches!(err, FrameParseError::Malformed { .. }));
        // errors are passed around by value
        assert_eq!(err.clone(), err);
        assert!(err.to_string().starts_with("malformed field near"));
    }

    #[test]
    fn non_finite_counts_are_rejected() {
        for line in [
            "100,nan,0,0,1,0,0,0,1,0,0,0,0",
            "100,0,inf,0,1,0,0,0,1,0,0,0,0",
            "100,0,0,0,1,-infinity,0,0,1,0,0,0,0",
            "100,0,0,0,1,0,0,0,1,0,0,0,NaN",
        ] {
            assert!(
                matches!(
                    HardwareEvent::from_str(line),
                    Err(FrameParseError::Malformed { .. })
                ),
                "{line:?} should be rejected"
            );
        }
    }
}
