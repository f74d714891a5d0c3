//! mazerig drives a virtual-maze rig for head-fixed mice. A mouse runs on an
//! air-supported trackball read by two optical sensors; their displacement
//! counts arrive over serial and become a pose in a virtual hallway. When
//! the mouse reaches the end of the hallway it gets a drop of water and is
//! put back at the start. If it falls off, it is put back after a timeout.
//!
//! The pipeline is split the same way the rig is:
//!
//! - [sensor_frame] and [frame_source] turn serial lines into frames.
//! - [motion] integrates frames into a [pose::Pose].
//! - [events] detects falls and trial ends, and [trial] acts on them.
//! - [reward] pulses the water valve.
//! - [experiment] ties one session together and [host] serves it to
//!   3D viewers over [transport].
//!
//! The `mazerig` binary runs the host, `monitor` shows a live trace of the
//! trackball on the terminal.

#![warn(missing_docs)]
pub mod args;
pub mod broadcast;
pub mod config;
pub mod data_log;
pub mod error;
pub mod events;
pub mod experiment;
pub mod frame_source;
pub mod gui;
pub mod hardware;
pub mod host;
pub mod motion;
pub mod pose;
pub mod protocol;
pub mod reward;
pub mod sensor_frame;
pub mod serial_reader;
pub mod simulated;
pub mod transport;
pub mod trial;
