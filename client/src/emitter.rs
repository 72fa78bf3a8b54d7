//! Sender side: publish our position at a fixed cadence.
//!
//! Where the position comes from is a `PositionSource`, two are provided:
//!
//! - `FixedPosition`, always the same spot,
//! - `TrackPosition`, cycling through a list of points (loaded from a file or given in code).
//!
//! The emitter sends once right away then every `interval`.  A failed tick (no position, not
//! connected, hub rejection) is logged and counted but never stops the cadence.
//!
use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::{Coordinate, CoordinateStreamClient, Stats};

/// Where our current position comes from.
///
#[async_trait]
pub trait PositionSource: Debug + Send + Sync {
    /// Current (latitude, longitude).
    async fn current(&self) -> Result<(f64, f64)>;
}

#[derive(Clone, Copy, Debug)]
pub struct FixedPosition {
    pub latitude: f64,
    pub longitude: f64,
}

impl FixedPosition {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        FixedPosition {
            latitude,
            longitude,
        }
    }
}

#[async_trait]
impl PositionSource for FixedPosition {
    async fn current(&self) -> Result<(f64, f64)> {
        Ok((self.latitude, self.longitude))
    }
}

/// Replays a list of points, starting over at the end.
///
#[derive(Debug)]
pub struct TrackPosition {
    points: Vec<(f64, f64)>,
    next: AtomicUsize,
}

impl TrackPosition {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self> {
        if points.is_empty() {
            return Err(eyre!("empty track"));
        }
        Ok(TrackPosition {
            points,
            next: AtomicUsize::new(0),
        })
    }

    /// Load a track, one `lat,lon` per line.  Blank lines and `#` comments are skipped.
    ///
    #[tracing::instrument]
    pub fn from_file(fname: &Path) -> Result<Self> {
        let data = fs::read_to_string(fname)?;
        let points = data
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
            .map(|(n, l)| {
                parse_point(l)
                    .ok_or_else(|| eyre!("{}:{}: bad point {l:?}", fname.display(), n + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("{} point(s) in {}", points.len(), fname.display());
        Self::new(points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn parse_point(line: &str) -> Option<(f64, f64)> {
    let (lat, lon) = line.split_once(',')?;
    Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
}

#[async_trait]
impl PositionSource for TrackPosition {
    async fn current(&self) -> Result<(f64, f64)> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(self.points[n % self.points.len()])
    }
}

#[derive(Debug)]
pub struct PeriodicEmitter {
    client: Arc<CoordinateStreamClient>,
    source: Arc<dyn PositionSource>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<Stats>>,
}

impl PeriodicEmitter {
    /// `interval` must not be zero.
    ///
    #[tracing::instrument(skip(client))]
    pub fn new(
        client: Arc<CoordinateStreamClient>,
        source: Arc<dyn PositionSource>,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(eyre!("emitter interval must be greater than zero"));
        }
        Ok(PeriodicEmitter {
            client,
            source,
            interval,
            task: Mutex::new(None),
            stats: Arc::new(Mutex::new(Stats::default())),
        })
    }

    pub fn stats(&self) -> Stats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Send our current position now, outside of the cadence.
    ///
    pub async fn emit_once(&self) -> Result<Coordinate> {
        emit(&self.client, self.source.as_ref(), &self.stats).await
    }

    /// Start the cadence.  Returns `false` if it was already running.
    ///
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> bool {
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(e) => e.into_inner(),
        };
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            trace!("already running");
            return false;
        }

        let client = self.client.clone();
        let source = self.source.clone();
        let stats = self.stats.clone();
        let every = self.interval;

        info!("emitting every {every:?}");
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // First tick completes immediately.
                ticker.tick().await;
                if let Ok(mut s) = stats.lock() {
                    s.ticks += 1;
                }
                let _ = emit(&client, source.as_ref(), &stats).await;
            }
        }));
        true
    }

    /// Stop the cadence, no-op if not running.
    ///
    #[tracing::instrument(skip(self))]
    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(h) = task.take() {
                debug!("stopping emitter");
                h.abort();
            }
        }
    }
}

impl Drop for PeriodicEmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn emit(
    client: &CoordinateStreamClient,
    source: &dyn PositionSource,
    stats: &Mutex<Stats>,
) -> Result<Coordinate> {
    let res = async {
        let identity = client
            .identity()
            .ok_or_else(|| eyre!("no identity, connect first"))?;
        let (lat, lon) = source.current().await?;
        let coord = Coordinate::new(lat, lon, &identity)?;
        client.send_coordinate(coord.clone()).await?;
        Ok::<_, eyre::Report>(coord)
    }
    .await;

    if let Ok(mut s) = stats.lock() {
        match &res {
            Ok(coord) => {
                trace!("emitted {coord}");
                s.sent += 1;
            }
            Err(e) => {
                warn!("emit failed: {e}");
                s.err += 1;
            }
        }
    }
    res
}
