//! Per-session tab separated log.
//!
//! The first line names the columns:
//!
//! ```text
//! timestamp	x	y	height	heading	vx	vy	vz	vheading	trial	rewards	water
//! ```
//!
//! One row follows for every hardware sample. The hardware timestamp is the
//! key: a sample that repeats the previous timestamp is not written again.
//! `vz` is `NaN` while the physics engine owns vertical motion.
//!
//! [FrameLog] writes the raw trackball frames the host receives while no
//! session interprets them, one row per frame with [FRAME_COLUMNS].

use crate::pose::{Pose, Velocity};
use crate::sensor_frame::SensorFrame;

use log::{debug, info};
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// Column names, in order.
pub const COLUMNS: [&str; 12] = [
    "timestamp",
    "x",
    "y",
    "height",
    "heading",
    "vx",
    "vy",
    "vz",
    "vheading",
    "trial",
    "rewards",
    "water",
];

/// Column names of a [FrameLog], in order.
pub const FRAME_COLUMNS: [&str; 9] = [
    "timestamp",
    "left_dx",
    "left_dy",
    "left_quality",
    "left_surface",
    "right_dx",
    "right_dy",
    "right_quality",
    "right_surface",
];

fn stamped_path(dir: &Path, stem: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Ok(dir.join(format!("{}-{}.tsv", stem, stamp)))
}

fn open_with_header(path: &Path, columns: &[&str]) -> io::Result<BufWriter<File>> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{}", columns.join("\t"))?;
    writer.flush()?;
    Ok(writer)
}

/// One row of the log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogRow {
    /// Hardware timestamp of the sample
    pub timestamp: u64,
    #[allow(missing_docs)]
    pub pose: Pose,
    #[allow(missing_docs)]
    pub velocity: Velocity,
    #[allow(missing_docs)]
    pub trial_number: u32,
    #[allow(missing_docs)]
    pub num_rewards: u32,
    /// Whether water was delivered on this sample
    pub water: bool,
}

/// An open session log.
#[derive(Debug)]
pub struct DataLog {
    writer: BufWriter<File>,
    path: PathBuf,
    last_timestamp: Option<u64>,
    rows: u64,
    duplicates: u64,
}

impl DataLog {
    /// Create `<experiment>-<unix seconds>.tsv` inside `dir`, creating the
    /// directory if needed, and write the header.
    pub fn create(dir: impl AsRef<Path>, experiment: &str) -> io::Result<Self> {
        Self::create_at(stamped_path(dir.as_ref(), experiment)?)
    }

    /// Create a log at exactly `path` and write the header.
    pub fn create_at(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = open_with_header(&path, &COLUMNS)?;
        info!("logging session data to {}", path.display());
        Ok(DataLog {
            writer,
            path,
            last_timestamp: None,
            rows: 0,
            duplicates: 0,
        })
    }

    /// Append a row. Returns `false` when the row repeats the previous
    /// timestamp and was skipped.
    pub fn record(&mut self, row: &LogRow) -> io::Result<bool> {
        if self.last_timestamp == Some(row.timestamp) {
            self.duplicates += 1;
            debug!("skipping duplicate sample {}", row.timestamp);
            return Ok(false);
        }
        let vz = row.velocity.vz.value().unwrap_or(f64::NAN);
        writeln!(
            self.writer,
            "{}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{}\t{}\t{}",
            row.timestamp,
            row.pose.x,
            row.pose.y,
            row.pose.height,
            row.pose.heading,
            row.velocity.vx,
            row.velocity.vy,
            vz,
            row.velocity.vheading,
            row.trial_number,
            row.num_rewards,
            u8::from(row.water),
        )?;
        self.writer.flush()?;
        self.last_timestamp = Some(row.timestamp);
        self.rows += 1;
        Ok(true)
    }

    /// Rows written so far, header excluded.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Samples skipped as duplicates.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    #[allow(missing_docs)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file.
    pub fn close(mut self) -> io::Result<PathBuf> {
        self.writer.flush()?;
        info!(
            "closed {} ({} rows, {} duplicates skipped)",
            self.path.display(),
            self.rows,
            self.duplicates
        );
        Ok(self.path)
    }
}

/// Raw trackball frames, written as they arrive.
#[derive(Debug)]
pub struct FrameLog {
    writer: BufWriter<File>,
    path: PathBuf,
    rows: u64,
}

impl FrameLog {
    /// Create `frames-<unix seconds>.tsv` inside `dir`.
    pub fn create(dir: impl AsRef<Path>) -> io::Result<Self> {
        Self::create_at(stamped_path(dir.as_ref(), "frames")?)
    }

    /// Create a log at exactly `path` and write the header.
    pub fn create_at(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = open_with_header(&path, &FRAME_COLUMNS)?;
        info!("logging raw frames to {}", path.display());
        Ok(FrameLog {
            writer,
            path,
            rows: 0,
        })
    }

    /// Append one frame. Buffered; flushed on [FrameLog::close].
    pub fn record(&mut self, frame: &SensorFrame) -> io::Result<()> {
        let (l, r) = (&frame.left, &frame.right);
        writeln!(
            self.writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            frame.timestamp,
            l.dx,
            l.dy,
            l.quality,
            u8::from(l.on_surface),
            r.dx,
            r.dy,
            r.quality,
            u8::from(r.on_surface),
        )?;
        self.rows += 1;
        Ok(())
    }

    /// Frames written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    #[allow(missing_docs)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file.
    pub fn close(mut self) -> io::Result<PathBuf> {
        self.writer.flush()?;
        info!("closed {} ({} frames)", self.path.display(), self.rows);
        Ok(self.path)
    }
}
