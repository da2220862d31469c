use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::Map;

/// Number of frames kept in memory before they are appended to the record file.
pub const RING_SIZE: usize = 1000;

/// Timings of one frame driven by the scheduler.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameRecord {
    pub frame: u64,
    /// Time spent scheduling the frame's task before executing anything.
    pub overhead: Duration,
    pub total: Duration,
    /// Executions and total execution time per monitored kind, in registration order.
    pub kinds: Vec<(u32, Duration)>,
}

impl FrameRecord {
    fn write_line(&self, w: &mut impl Write) -> std::io::Result<()> {
        write!(
            w,
            "{} {} {}",
            self.frame,
            self.overhead.as_micros(),
            self.total.as_micros()
        )?;
        for (count, duration) in &self.kinds {
            write!(w, " {} {}", count, duration.as_micros())?;
        }
        writeln!(w)
    }
}

pub(crate) struct FrameMonitor {
    index: Map<String, usize>,
    current: Vec<(u32, Duration)>,
    frames: VecDeque<FrameRecord>,
    file: Option<PathBuf>,
}

impl FrameMonitor {
    pub(crate) fn new(kinds: &[String], file: Option<PathBuf>) -> Self {
        let mut monitor = FrameMonitor {
            index: Map::default(),
            current: Vec::new(),
            frames: VecDeque::with_capacity(RING_SIZE),
            file,
        };
        for kind in kinds {
            monitor.monitor(kind);
        }
        monitor
    }

    pub(crate) fn monitor(&mut self, kind: &str) {
        if !self.index.contains_key(kind) {
            self.index.insert(kind.to_owned(), self.current.len());
            self.current.push((0, Duration::ZERO));
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.index.is_empty()
    }

    pub(crate) fn record_task(&mut self, kind: &str, duration: Duration) {
        if let Some(&i) = self.index.get(kind) {
            let (count, total) = &mut self.current[i];
            *count += 1;
            *total += duration;
        }
    }

    /// Close the current frame. Once the ring is full its content is appended to the record file
    /// (if any) and the ring starts over.
    pub(crate) fn end_frame(&mut self, frame: u64, overhead: Duration, total: Duration) -> Result<()> {
        let kinds = self
            .current
            .iter_mut()
            .map(|c| std::mem::replace(c, (0, Duration::ZERO)))
            .collect();
        self.frames.push_back(FrameRecord {
            frame,
            overhead,
            total,
            kinds,
        });
        if self.frames.len() >= RING_SIZE {
            self.flush()?;
            self.frames.clear();
        }
        Ok(())
    }

    pub(crate) fn frames(&self) -> Vec<FrameRecord> {
        self.frames.iter().cloned().collect()
    }

    /// Append the frames in the ring to the record file.
    pub(crate) fn flush(&self) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        if self.frames.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::Monitor)?;
        let mut w = BufWriter::new(file);
        for f in &self.frames {
            f.write_line(&mut w).map_err(Error::Monitor)?;
        }
        w.flush().map_err(Error::Monitor)
    }
}
