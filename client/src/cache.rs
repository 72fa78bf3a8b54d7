//! Process-wide reverse lookup cache.
//!
//! Coordinates are keyed by their rounded cell (see `CellKey`), so two positions a few metres
//! apart share one entry.  For each cell there is at most one lookup in flight: later callers
//! get a clone of the same shared future instead of a new request.
//!
//! Settled results are kept in two `mini_moka` caches, both bounded in size:
//!
//! - `places` for resolved places, with the normal TTL,
//! - `failures` for errors, with a much shorter TTL so a failing geocoder is not hammered but
//!   is tried again soon enough.
//!
//! The check of both caches, the in-flight map lookup and the registration of a new lookup
//! all happen under the one `in_flight` lock, as does the move of a settled result from the
//! in-flight map into a cache.  That is what keeps the "one lookup per cell" guarantee.
//!
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use mini_moka::sync::Cache;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::{
    CacheConfig, CellKey, Coordinate, LookupError, Place, ResolvedLocation, ReverseGeocoder, Stats,
};

type Settled = Result<(Place, DateTime<Utc>), LookupError>;
type Lookup = Shared<BoxFuture<'static, Settled>>;
type InFlight = Arc<Mutex<HashMap<CellKey, Lookup>>>;

#[derive(Clone)]
pub struct GeoLookupCache {
    geocoder: Arc<dyn ReverseGeocoder>,
    precision: u32,
    lookup_timeout: Duration,
    places: Cache<CellKey, (Place, DateTime<Utc>)>,
    failures: Cache<CellKey, LookupError>,
    in_flight: InFlight,
    stats: Arc<Mutex<Stats>>,
}

impl Debug for GeoLookupCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoLookupCache")
            .field("geocoder", &self.geocoder)
            .field("precision", &self.precision)
            .field("lookup_timeout", &self.lookup_timeout)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl GeoLookupCache {
    #[tracing::instrument(skip(geocoder))]
    pub fn new(geocoder: Arc<dyn ReverseGeocoder>, cfg: &CacheConfig) -> Self {
        let places = Cache::builder()
            .max_capacity(cfg.capacity)
            .time_to_live(Duration::from_secs(cfg.ttl_secs))
            .build();
        let failures = Cache::builder()
            .max_capacity(cfg.capacity)
            .time_to_live(Duration::from_secs(cfg.negative_ttl_secs))
            .build();

        GeoLookupCache {
            geocoder,
            precision: cfg.precision,
            lookup_timeout: Duration::from_millis(cfg.lookup_timeout_ms),
            places,
            failures,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(Stats::default())),
        }
    }

    #[inline]
    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn stats(&self) -> Stats {
        lock(&self.stats).clone()
    }

    /// Resolve `coord`, from the cache, by joining the lookup already running for its cell or
    /// by starting a new one.
    ///
    /// The returned location always carries `coord` itself, even when the place was found for
    /// another coordinate of the same cell.
    ///
    #[tracing::instrument(skip(self, coord), fields(coord = %coord))]
    pub async fn resolve(&self, coord: &Coordinate) -> Result<ResolvedLocation, LookupError> {
        let key = coord.cell(self.precision);

        let lookup = {
            let mut in_flight = lock(&self.in_flight);

            if let Some((place, at)) = self.places.get(&key) {
                trace!("hit {key:?}");
                lock(&self.stats).hits += 1;
                return Ok(ResolvedLocation::new(coord.clone(), place, at));
            }
            if let Some(err) = self.failures.get(&key) {
                trace!("negative hit {key:?}");
                lock(&self.stats).hits += 1;
                return Err(err);
            }

            match in_flight.get(&key) {
                Some(lookup) => {
                    debug!("joining lookup in flight for {key:?}");
                    lock(&self.stats).coalesced += 1;
                    lookup.clone()
                }
                None => {
                    debug!("miss {key:?}");
                    lock(&self.stats).miss += 1;
                    let lookup = self.start(key, coord.latitude(), coord.longitude());
                    in_flight.insert(key, lookup.clone());
                    lookup
                }
            }
        };

        let (place, at) = lookup.await?;
        Ok(ResolvedLocation::new(coord.clone(), place, at))
    }

    /// Run one geocoder call in its own task so it settles (and is cached) even if every
    /// caller gave up waiting.
    ///
    fn start(&self, key: CellKey, latitude: f64, longitude: f64) -> Lookup {
        let geocoder = self.geocoder.clone();
        let bound = self.lookup_timeout;
        let places = self.places.clone();
        let failures = self.failures.clone();
        let in_flight = self.in_flight.clone();
        let stats = self.stats.clone();

        let handle = tokio::spawn(async move {
            lock(&stats).lookups += 1;

            let res = match timeout(bound, geocoder.reverse(latitude, longitude)).await {
                Ok(res) => res,
                Err(_) => {
                    warn!("lookup for {key:?} timed out after {bound:?}");
                    Err(LookupError::Timeout)
                }
            };
            let res = res.map(|place| (place, Utc::now()));

            let mut in_flight = lock(&in_flight);
            match &res {
                Ok(v) => places.insert(key, v.clone()),
                Err(e) => {
                    debug!("lookup for {key:?} failed: {e}");
                    lock(&stats).err += 1;
                    failures.insert(key, e.clone());
                }
            }
            in_flight.remove(&key);
            res
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(LookupError::Network(format!("lookup aborted: {e}"))))
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::fake::{place, FakeGeocoder};
    use futures::future::join_all;

    fn config() -> CacheConfig {
        CacheConfig {
            precision: 4,
            capacity: 16,
            ttl_secs: 60,
            negative_ttl_secs: 1,
            lookup_timeout_ms: 1_000,
        }
    }

    fn dhaka() -> Coordinate {
        Coordinate::new(23.78, 90.4, "a").unwrap()
    }

    #[tokio::test]
    async fn test_second_resolve_is_a_hit() {
        let geo = Arc::new(FakeGeocoder::fixed("Dhaka, Bangladesh", Duration::ZERO));
        let cache = GeoLookupCache::new(geo.clone(), &config());

        let one = cache.resolve(&dhaka()).await.unwrap();
        let two = cache.resolve(&dhaka()).await.unwrap();

        assert_eq!("Dhaka, Bangladesh", one.display_name);
        assert_eq!(one.display_name, two.display_name);
        assert_eq!(1, geo.calls());

        let st = cache.stats();
        assert_eq!(1, st.miss);
        assert_eq!(1, st.hits);
        assert_eq!(1, st.lookups);
    }

    #[tokio::test]
    async fn test_same_cell_shares_entry() {
        let geo = Arc::new(FakeGeocoder::fixed("Dhaka, Bangladesh", Duration::ZERO));
        let cache = GeoLookupCache::new(geo.clone(), &config());

        let near = Coordinate::new(23.780_04, 90.399_96, "b").unwrap();
        cache.resolve(&dhaka()).await.unwrap();
        let loc = cache.resolve(&near).await.unwrap();

        assert_eq!(1, geo.calls());
        assert_eq!(near, loc.coordinate);
    }

    #[tokio::test]
    async fn test_other_cell_is_a_miss() {
        let geo = Arc::new(FakeGeocoder::fixed("somewhere", Duration::ZERO));
        let cache = GeoLookupCache::new(geo.clone(), &config());

        cache.resolve(&dhaka()).await.unwrap();
        cache
            .resolve(&Coordinate::new(23.79, 90.4, "a").unwrap())
            .await
            .unwrap();
        assert_eq!(2, geo.calls());
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let geo = Arc::new(FakeGeocoder::fixed("Dhaka, Bangladesh", Duration::from_millis(100)));
        let cache = GeoLookupCache::new(geo.clone(), &config());

        let coords: Vec<_> = (0..10)
            .map(|i| Coordinate::new(23.78, 90.4, &format!("user{i}")).unwrap())
            .collect();
        let all = join_all(coords.iter().map(|c| cache.resolve(c))).await;

        assert_eq!(1, geo.calls());
        for (res, c) in all.into_iter().zip(coords.iter()) {
            let loc = res.unwrap();
            assert_eq!("Dhaka, Bangladesh", loc.display_name);
            assert_eq!(c.source_id(), loc.coordinate.source_id());
        }
        let st = cache.stats();
        assert_eq!(1, st.miss);
        assert_eq!(9, st.coalesced);
    }

    #[tokio::test]
    async fn test_failure_is_cached_briefly() {
        let geo = Arc::new(FakeGeocoder::new(|_, _| {
            (Duration::ZERO, Err(LookupError::NotFound))
        }));
        let cache = GeoLookupCache::new(geo.clone(), &config());

        assert_eq!(Err(LookupError::NotFound), cache.resolve(&dhaka()).await);
        assert_eq!(Err(LookupError::NotFound), cache.resolve(&dhaka()).await);
        assert_eq!(1, geo.calls());

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(Err(LookupError::NotFound), cache.resolve(&dhaka()).await);
        assert_eq!(2, geo.calls());
        assert_eq!(2, cache.stats().err);
    }

    #[tokio::test]
    async fn test_lookup_timeout() {
        let geo = Arc::new(FakeGeocoder::fixed("late", Duration::from_secs(5)));
        let cfg = CacheConfig {
            lookup_timeout_ms: 100,
            ..config()
        };
        let cache = GeoLookupCache::new(geo.clone(), &cfg);

        let res = cache.resolve(&dhaka()).await;
        assert_eq!(Err(LookupError::Timeout), res);
        assert!(res.unwrap_err().is_network());
    }

    #[tokio::test]
    async fn test_place_fields_kept() {
        let geo = Arc::new(FakeGeocoder::new(|_, _| (Duration::ZERO, Ok(place("Dhaka")))));
        let cache = GeoLookupCache::new(geo, &config());

        let loc = cache.resolve(&dhaka()).await.unwrap();
        assert_eq!(Some("place / city".to_string()), loc.kind());
    }
}
