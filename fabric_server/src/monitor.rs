// Frame taps: observers attached to switch ports.
//
// The switch calls `FrameTap::observe` for every frame it receives on a
// tapped port (`Direction::Rx`, before forwarding) and every frame it
// delivers to one (`Direction::Tx`, after the write). Taps only look; they
// cannot change or drop a frame, and the switch skips them entirely while
// monitoring is off.
//
// Provided taps:
// - `TrafficMonitor`: per-port frame and byte counters.
// - `FrameRecorder`: keeps every observation in memory, in order.
// - `FrameLog`: appends one JSON object per observation to a writer.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use fabric_protocol::{EthernetFrame, MacAddress, PortIndex};
use serde::Serialize;
use tracing::{trace, warn};

use crate::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the client on this port.
    Rx,
    /// Transmitted by the switch to the client on this port.
    Tx,
}

/// Read-only observer of frames crossing a switch port.
pub trait FrameTap: Send + Sync {
    fn observe(&self, direction: Direction, port: PortIndex, frame: &EthernetFrame);
}

#[derive(Default)]
struct PortCounters {
    rx_frames: AtomicU64,
    rx_bytes: AtomicU64,
    tx_frames: AtomicU64,
    tx_bytes: AtomicU64,
}

/// Counter snapshot for one port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStats {
    pub rx_frames: u64,
    pub rx_bytes: u64,
    pub tx_frames: u64,
    pub tx_bytes: u64,
}

/// Per-port traffic counters.
pub struct TrafficMonitor {
    ports: Vec<PortCounters>,
}

impl TrafficMonitor {
    pub fn new(ports: usize) -> Self {
        Self {
            ports: (0..ports).map(|_| PortCounters::default()).collect(),
        }
    }

    pub fn stats(&self, port: PortIndex) -> PortStats {
        self.ports
            .get(port.as_usize())
            .map(|c| PortStats {
                rx_frames: c.rx_frames.load(Ordering::Relaxed),
                rx_bytes: c.rx_bytes.load(Ordering::Relaxed),
                tx_frames: c.tx_frames.load(Ordering::Relaxed),
                tx_bytes: c.tx_bytes.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Sum over every port.
    pub fn totals(&self) -> PortStats {
        (0..self.ports.len())
            .map(|i| self.stats(PortIndex(i as u32)))
            .fold(PortStats::default(), |acc, s| PortStats {
                rx_frames: acc.rx_frames + s.rx_frames,
                rx_bytes: acc.rx_bytes + s.rx_bytes,
                tx_frames: acc.tx_frames + s.tx_frames,
                tx_bytes: acc.tx_bytes + s.tx_bytes,
            })
    }
}

impl FrameTap for TrafficMonitor {
    fn observe(&self, direction: Direction, port: PortIndex, frame: &EthernetFrame) {
        let Some(counters) = self.ports.get(port.as_usize()) else {
            return;
        };
        let bytes = frame.wire_len() as u64;
        let (frames, total) = match direction {
            Direction::Rx => (&counters.rx_frames, &counters.rx_bytes),
            Direction::Tx => (&counters.tx_frames, &counters.tx_bytes),
        };
        frames.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes, Ordering::Relaxed);
        trace!(
            ?direction,
            %port,
            src = %frame.source,
            dst = %frame.destination,
            bytes,
            "frame observed"
        );
    }
}

/// One recorded tap callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub direction: Direction,
    pub port: PortIndex,
    pub frame: EthernetFrame,
}

/// Keeps every observation, in callback order.
#[derive(Default)]
pub struct FrameRecorder {
    observations: Mutex<Vec<Observation>>,
}

impl FrameRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observations(&self) -> Vec<Observation> {
        lock(&self.observations).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.observations).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.observations).is_empty()
    }
}

impl FrameTap for FrameRecorder {
    fn observe(&self, direction: Direction, port: PortIndex, frame: &EthernetFrame) {
        lock(&self.observations).push(Observation {
            direction,
            port,
            frame: frame.clone(),
        });
    }
}

#[derive(Serialize)]
struct LogRecord {
    seq: u64,
    dir: Direction,
    port: u32,
    src: MacAddress,
    dst: MacAddress,
    ether_type: u16,
    len: usize,
}

struct LogWriter<W> {
    out: W,
    seq: u64,
}

/// Writes observations as JSON lines. The payload itself is not logged,
/// only addressing and size.
pub struct FrameLog<W: Write + Send> {
    writer: Mutex<LogWriter<W>>,
}

impl FrameLog<BufWriter<File>> {
    /// Create (or truncate) `path` and log to it.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> FrameLog<W> {
    pub fn new(out: W) -> Self {
        Self {
            writer: Mutex::new(LogWriter { out, seq: 0 }),
        }
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(self) -> io::Result<W> {
        let mut writer = self
            .writer
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        writer.out.flush()?;
        Ok(writer.out)
    }

    fn write_record(
        writer: &mut LogWriter<W>,
        direction: Direction,
        port: PortIndex,
        frame: &EthernetFrame,
    ) -> io::Result<()> {
        let record = LogRecord {
            seq: writer.seq,
            dir: direction,
            port: port.0,
            src: frame.source,
            dst: frame.destination,
            ether_type: frame.ether_type,
            len: frame.wire_len(),
        };
        writer.seq += 1;
        serde_json::to_writer(&mut writer.out, &record)?;
        writer.out.write_all(b"\n")?;
        writer.out.flush()
    }
}

impl<W: Write + Send> FrameTap for FrameLog<W> {
    fn observe(&self, direction: Direction, port: PortIndex, frame: &EthernetFrame) {
        let mut writer = lock(&self.writer);
        if let Err(e) = Self::write_record(&mut writer, direction, port, frame) {
            warn!(%port, error = %e, "frame log write failed");
        }
    }
}
