//! Reads trackball frames off a serial port on a background thread.

use crate::error::HardwareError;
use crate::frame_source::{FrameBuffer, FrameSource};

use log::{debug, info, warn};
use serial2::SerialPort;
use std::{
    io,
    path::PathBuf,
    str,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// How long a single read may block before the stop flag is checked again.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest line kept while waiting for `\n`. A frame is well under 100 bytes.
const MAX_LINE: usize = 1024;

/// Everything needed to bring the device up and down.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyACM0`
    pub port: String,
    #[allow(missing_docs)]
    pub baud_rate: u32,
    /// Sent once after opening, before streaming starts
    pub init_string: Option<String>,
    /// Sent to start streaming
    pub start_command: Option<String>,
    /// Sent before the port is closed
    pub stop_command: Option<String>,
    /// Pause after each command so the firmware can react
    pub settle: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            port: "/dev/ttyACM0".to_owned(),
            baud_rate: 115200,
            init_string: None,
            start_command: Some("START,50,0\n".to_owned()),
            stop_command: Some("STOP\n".to_owned()),
            settle: Duration::from_millis(500),
        }
    }
}

/// Every serial device the OS knows about.
pub fn available_ports() -> Result<Vec<PathBuf>, HardwareError> {
    Ok(SerialPort::available_ports()?)
}

/// A [FrameSource] backed by a real serial device.
pub struct SerialReader {
    settings: SerialSettings,
    port: Option<Arc<SerialPort>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    buffer: FrameBuffer,
}

impl SerialReader {
    /// Open the port, run the start-up commands and begin reading into
    /// `buffer`. If anything fails the port is closed before returning.
    pub fn open(settings: SerialSettings, buffer: FrameBuffer) -> Result<Self, HardwareError> {
        let mut port = SerialPort::open(&settings.port, settings.baud_rate).map_err(|source| {
            HardwareError::PortUnavailable {
                port: settings.port.clone(),
                source,
            }
        })?;
        port.set_read_timeout(READ_TIMEOUT)?;
        info!(
            "opened {} at {} baud",
            settings.port, settings.baud_rate
        );

        for command in [&settings.init_string, &settings.start_command]
            .into_iter()
            .flatten()
        {
            port.write_all(command.as_bytes())?;
            debug!("sent {:?} to {}", command.trim(), settings.port);
            thread::sleep(settings.settle);
        }

        let port = Arc::new(port);
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_reader(
            Arc::clone(&port),
            Arc::clone(&running),
            buffer.clone(),
            settings.port.clone(),
        )?;

        Ok(SerialReader {
            settings,
            port: Some(port),
            running,
            handle: Some(handle),
            buffer,
        })
    }
}

fn spawn_reader(
    port: Arc<SerialPort>,
    running: Arc<AtomicBool>,
    buffer: FrameBuffer,
    name: String,
) -> Result<JoinHandle<()>, HardwareError> {
    let builder = thread::Builder::new().name(format!("serial {}", name));
    let handle = builder.spawn(move || {
        let mut chunk = [0; 256];
        let mut lines = LineAssembler::new(MAX_LINE);

        while running.load(Ordering::Relaxed) {
            let read_len = match port.read(&mut chunk) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // transient: log and keep reading
                    warn!("serial read on {} failed: {}", name, e);
                    thread::sleep(READ_TIMEOUT);
                    continue;
                }
            };

            lines.push(&chunk[..read_len], &name, |s| {
                buffer.ingest_line(s);
            });
        }
        debug!("serial reader for {} exiting", name);
    })?;
    Ok(handle)
}

/// Splits a byte stream into `\n` terminated lines.
///
/// A line longer than the limit is dropped whole, up to and including its
/// terminator, so its tail is never mistaken for a frame.
struct LineAssembler {
    line: Vec<u8>,
    limit: usize,
    discarding: bool,
}

impl LineAssembler {
    fn new(limit: usize) -> Self {
        LineAssembler {
            line: Vec::with_capacity(128),
            limit,
            discarding: false,
        }
    }

    fn push(&mut self, bytes: &[u8], name: &str, mut on_line: impl FnMut(&str)) {
        for &c in bytes {
            if c == b'\n' {
                if !self.discarding {
                    match str::from_utf8(&self.line) {
                        Ok(s) => on_line(s),
                        // Often happens at the beginning of transmission when
                        // there is still garbage in the hardware buffer
                        Err(e) => warn!("failed to decode utf-8 from {}: {:?}", name, e),
                    }
                }
                self.line.clear();
                self.discarding = false;
            } else if !self.discarding {
                if self.line.len() == self.limit {
                    warn!(
                        "no line end from {} after {} bytes, wrong baud rate?",
                        name, self.limit
                    );
                    self.line.clear();
                    self.discarding = true;
                } else {
                    self.line.push(c);
                }
            }
        }
    }
}

impl FrameSource for SerialReader {
    fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    fn send_command(&mut self, command: &str) -> Result<(), HardwareError> {
        match &self.port {
            Some(port) => Ok(port.write_all(command.as_bytes())?),
            None => Err(HardwareError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial port already closed",
            ))),
        }
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        let Some(port) = self.port.take() else {
            return Ok(());
        };
        let mut first_error = None;

        if let Some(stop) = &self.settings.stop_command {
            if let Err(e) = port.write_all(stop.as_bytes()) {
                warn!("could not send stop command to {}: {}", self.settings.port, e);
                first_error.get_or_insert(HardwareError::Io(e));
            } else {
                thread::sleep(self.settings.settle.min(Duration::from_millis(200)));
            }
        }

        // the reader must be gone before the port is dropped
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                first_error.get_or_insert(HardwareError::ThreadPanicked("serial reader"));
            }
        }
        drop(port);
        info!("closed {}", self.settings.port);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn describe(&self) -> String {
        format!("{} @ {}", self.settings.port, self.settings.baud_rate)
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("error while closing {}: {}", self.settings.port, e);
        }
    }
}
