use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tether_proto::PositionFix;
use tether_svc::{FixFeed, FixSource, FixSourceError, SamplingPolicy};
use time::OffsetDateTime;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

const KNOTS_TO_MPS: f32 = 0.514_444;

/// NMEA-backed positioning sources: a live serial receiver or a replayable
/// sentence file.
pub enum NmeaSource {
    Serial { device: String, baud: u32 },
    File { path: PathBuf },
}

#[async_trait]
impl FixSource for NmeaSource {
    async fn subscribe(
        &self,
        policy: &SamplingPolicy,
    ) -> Result<Box<dyn FixFeed>, FixSourceError> {
        let reader = match self {
            NmeaSource::Serial { device, baud } => {
                let port = tokio_serial::new(device, *baud).open_native_async().map_err(|e| {
                    FixSourceError::Subsystem(format!("open serial {}: {}", device, e))
                })?;
                debug!("gnss: subscribed to serial {}", device);
                NmeaReader::Serial(BufReader::new(port))
            }
            NmeaSource::File { path } => {
                let file = File::open(path).await.map_err(|e| {
                    FixSourceError::Subsystem(format!("open nmea file {}: {}", path.display(), e))
                })?;
                debug!("gnss: replaying {}", path.display());
                NmeaReader::File(BufReader::new(file))
            }
        };
        Ok(Box::new(NmeaFeed { reader, min_interval: policy.target, last_emit: None }))
    }
}

enum NmeaReader {
    Serial(BufReader<SerialStream>),
    File(BufReader<File>),
}

struct NmeaFeed {
    reader: NmeaReader,
    /// Fixes arriving faster than this are skipped, matching the sampling
    /// policy's target cadence.
    min_interval: Duration,
    last_emit: Option<Instant>,
}

#[async_trait]
impl FixFeed for NmeaFeed {
    async fn next_fix(&mut self) -> Result<PositionFix, FixSourceError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = match &mut self.reader {
                NmeaReader::Serial(r) => r.read_line(&mut line).await,
                NmeaReader::File(r) => r.read_line(&mut line).await,
            }
            .map_err(|_| FixSourceError::Unavailable)?;
            if n == 0 {
                // EOF on a replay file: idle like a receiver between fixes.
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            let Some(fix) = parse_rmc(line.trim()) else { continue };
            if let Some(last) = self.last_emit {
                if last.elapsed() < self.min_interval {
                    continue;
                }
            }
            self.last_emit = Some(Instant::now());
            return Ok(fix);
        }
    }
}

// RMC carries everything a sample needs: position, speed over ground
// (knots) and course. Void sentences (status V) are skipped.
fn parse_rmc(s: &str) -> Option<PositionFix> {
    if !(s.starts_with("$GNRMC") || s.starts_with("$GPRMC")) {
        return None;
    }
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() <= 8 || parts[2] != "A" {
        return None;
    }
    let lat = parse_deg_min(parts[3], parts[4])?;
    let lon = parse_deg_min(parts[5], parts[6])?;
    let speed = parts[7].parse::<f32>().ok().map(|knots| knots * KNOTS_TO_MPS);
    let bearing = parts[8].parse::<f32>().ok();

    Some(PositionFix {
        lat,
        lon,
        accuracy: None,
        speed,
        bearing,
        ts: OffsetDateTime::now_utc(),
    })
}

// lat: ddmm.mmmm, lon: dddmm.mmmm
fn parse_deg_min(v: &str, hemi: &str) -> Option<f64> {
    if v.is_empty() {
        return None;
    }
    let dot = v.find('.')?;
    let deg_len = if dot > 4 { 3 } else { 2 };
    let deg: f64 = v[..deg_len].parse().ok()?;
    let min: f64 = v[deg_len..].parse().ok()?;
    let mut out = deg + (min / 60.0);
    if hemi == "S" || hemi == "W" {
        out = -out;
    }
    Some(out)
}
