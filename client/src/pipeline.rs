//! Latest-wins reverse resolution.
//!
//! Every submitted coordinate gets the next sequence number and becomes the current target.
//! Lookups run concurrently and may settle in any order, a result is only published if its
//! sequence number is still the latest one.  Numbering and publishing both happen inside the
//! `watch` channel's lock so a late completion can never slip in between.
//!
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::{Coordinate, GeoLookupCache, LookupError, ResolvedLocation, Resolution};

#[derive(Clone, Debug)]
pub struct ReverseResolvePipeline {
    cache: GeoLookupCache,
    latest: Arc<AtomicU64>,
    slot: Arc<watch::Sender<Resolution>>,
    last_good: Arc<Mutex<Option<ResolvedLocation>>>,
}

impl ReverseResolvePipeline {
    pub fn new(cache: GeoLookupCache) -> Self {
        let (slot, _) = watch::channel(Resolution::Idle);
        ReverseResolvePipeline {
            cache,
            latest: Arc::new(AtomicU64::new(0)),
            slot: Arc::new(slot),
            last_good: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cache(&self) -> &GeoLookupCache {
        &self.cache
    }

    /// Snapshot of the current resolution, never blocks.
    ///
    pub fn resolution(&self) -> Resolution {
        self.slot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Resolution> {
        self.slot.subscribe()
    }

    /// Sequence number of the last submitted coordinate, 0 if none.
    ///
    pub fn latest(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    /// Make `coord` the current target and start resolving it.
    ///
    /// Does not wait for the lookup so it can be called from the dispatch path, it needs a
    /// Tokio runtime though.
    ///
    #[tracing::instrument(skip(self, coord), fields(coord = %coord))]
    pub fn submit(&self, coord: Coordinate) -> u64 {
        let mut seq = 0;
        self.slot.send_modify(|r| {
            seq = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
            *r = Resolution::Pending {
                coordinate: coord.clone(),
            };
        });
        trace!("submitted #{seq}");

        let this = self.clone();
        tokio::spawn(async move {
            let res = this.cache.resolve(&coord).await;
            this.complete(seq, coord, res);
        });
        seq
    }

    fn complete(&self, seq: u64, coord: Coordinate, res: Result<ResolvedLocation, LookupError>) {
        let published = self.slot.send_if_modified(|r| {
            if self.latest.load(Ordering::SeqCst) != seq {
                return false;
            }

            let mut last_good = self.last_good.lock().unwrap_or_else(|e| e.into_inner());
            *r = match res {
                Ok(loc) => {
                    *last_good = Some(loc.clone());
                    Resolution::Resolved(loc)
                }
                Err(reason) => Resolution::Failed {
                    coordinate: coord,
                    reason,
                    last_good: last_good.clone(),
                },
            };
            true
        });

        if published {
            debug!("published #{seq}");
        } else {
            debug!("discarding stale result #{seq}");
        }
    }
}
