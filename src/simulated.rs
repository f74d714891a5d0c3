//! A stand-in trackball for running the rig without hardware.
//!
//! It writes the same CSV lines the firmware does, at the same rate, so the
//! whole decode path is exercised.

use crate::error::HardwareError;
use crate::frame_source::{FrameBuffer, FrameSource};

use log::debug;
use rand::prelude::*;
use std::{
    sync::mpsc,
    thread,
    time::Duration,
};

/// Sample period of the real device.
pub const FRAME_PERIOD: Duration = Duration::from_millis(50);

enum Signal {
    Forward(f64),
    Turn(f64),
    Noise(f64),
    Streaming(bool),
    Stop,
}

/// Random-walk trackball producing 20 Hz frames on its own thread.
pub struct SimulatedTrackball {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
    buffer: FrameBuffer,
}

impl SimulatedTrackball {
    /// Start generating frames into `buffer`.
    pub fn start(buffer: FrameBuffer) -> Result<Self, HardwareError> {
        let (tx, rx) = mpsc::channel::<Signal>();
        let th_buffer = buffer.clone();

        let handle = thread::Builder::new()
            .name("simulated trackball".to_owned())
            .spawn(move || {
                let mut rng = thread_rng();
                let mut running = true;
                let mut streaming = true;
                let mut forward = 2.0;
                let mut turn = 0.0;
                let mut noise = 1.0;
                let mut timestamp: u64 = 0;
                let mut totals = [0.0; 4];
                while running {
                    while let Ok(received) = rx.try_recv() {
                        match received {
                            Signal::Forward(v) => forward = v,
                            Signal::Turn(v) => turn = v,
                            Signal::Noise(v) => noise = v,
                            Signal::Streaming(on) => streaming = on,
                            Signal::Stop => running = false,
                        }
                    }
                    if running && streaming {
                        timestamp += FRAME_PERIOD.as_micros() as u64;
                        let jitter = |rng: &mut ThreadRng| {
                            if noise > 0.0 {
                                rng.gen_range(-noise..noise)
                            } else {
                                0.0
                            }
                        };
                        let ldx = (turn + jitter(&mut rng)).round();
                        let rdx = (-turn + jitter(&mut rng)).round();
                        let ldy = (forward + jitter(&mut rng)).round();
                        let rdy = (forward + jitter(&mut rng)).round();
                        totals[0] += ldx;
                        totals[1] += ldy;
                        totals[2] += rdx;
                        totals[3] += rdy;
                        let line = format!(
                            "{},{},{},{},1,{},{},{},1,{},{},{},{}\r\n",
                            timestamp,
                            ldx,
                            ldy,
                            rng.gen_range(30..60),
                            rdx,
                            rdy,
                            rng.gen_range(30..60),
                            totals[0],
                            totals[1],
                            totals[2],
                            totals[3],
                        );
                        th_buffer.ingest_line(&line);
                    }
                    thread::sleep(FRAME_PERIOD);
                }
                debug!("simulated trackball stopped");
            })?;

        Ok(SimulatedTrackball {
            handle: Some(handle),
            tx,
            buffer,
        })
    }

    /// Mean forward counts per frame.
    pub fn set_forward(&self, counts: f64) {
        // A closed channel means the thread is gone, nothing left to steer.
        let _ = self.tx.send(Signal::Forward(counts));
    }

    /// Mean yaw counts per frame.
    pub fn set_turn(&self, counts: f64) {
        let _ = self.tx.send(Signal::Turn(counts));
    }

    /// Spread of the uniform noise added to every count.
    pub fn set_noise(&self, noise: f64) {
        let _ = self.tx.send(Signal::Noise(noise));
    }
}

impl FrameSource for SimulatedTrackball {
    fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    fn send_command(&mut self, command: &str) -> Result<(), HardwareError> {
        let command = command.trim();
        if command.starts_with("START") {
            let _ = self.tx.send(Signal::Streaming(true));
        } else if command.starts_with("STOP") {
            let _ = self.tx.send(Signal::Streaming(false));
        } else {
            debug!("simulated trackball ignoring {:?}", command);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        let _ = self.tx.send(Signal::Stop);
        // `.join()` consumes the handle, so take it out of the struct first
        if let Some(thread) = self.handle.take() {
            thread
                .join()
                .map_err(|_| HardwareError::ThreadPanicked("simulated trackball"))?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn describe(&self) -> String {
        "simulated trackball".to_owned()
    }
}

impl Drop for SimulatedTrackball {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_frames_until_stopped() {
        let buffer = FrameBuffer::new();
        let feed = buffer.attach_feed(16);
        let mut ball = SimulatedTrackball::start(buffer.clone()).unwrap();
        ball.set_noise(0.0);

        let first = feed.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = feed.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(second.frame.timestamp > first.frame.timestamp);
        assert!(second.seq > first.seq);

        ball.stop().unwrap();
        assert!(!ball.is_running());
        // stopping twice is fine
        ball.stop().unwrap();
        assert_eq!(buffer.stats().parse_errors, 0);
    }
}
