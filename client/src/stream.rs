//! `CoordinateStreamClient`, what an application talks to.
//!
//! It ties one `ChannelConnection` to one `ReverseResolvePipeline`: every coordinate received
//! from the hub (or successfully sent to it) becomes the latest coordinate and is submitted
//! for resolution.  Consumers only ever read snapshots or subscribe to changes, none of which
//! triggers network activity.
//!
use std::sync::Arc;

use eyre::Result;
use tokio::sync::watch;
use tracing::{info, trace};

use crate::{
    ChannelConnection, ClientConfig, ConnectError, ConnectionState, Coordinate, GeoLookupCache,
    HubConnector, NominatimGeocoder, Resolution, ReverseGeocoder, ReverseResolvePipeline,
    SendError, SignalRConnector, Stats,
};

#[derive(Debug)]
pub struct CoordinateStreamClient {
    connection: ChannelConnection,
    pipeline: ReverseResolvePipeline,
    latest: Arc<watch::Sender<Option<Coordinate>>>,
}

impl CoordinateStreamClient {
    /// Client talking SignalR to the configured hub and resolving through Nominatim.
    ///
    #[tracing::instrument]
    pub fn from_config(cfg: &ClientConfig) -> Result<Self> {
        let connector = Arc::new(SignalRConnector::from_config(&cfg.hub));
        let geocoder = Arc::new(NominatimGeocoder::new(&cfg.geocoder)?);
        Ok(Self::new(connector, geocoder, cfg))
    }

    pub fn new(
        connector: Arc<dyn HubConnector>,
        geocoder: Arc<dyn ReverseGeocoder>,
        cfg: &ClientConfig,
    ) -> Self {
        let cache = GeoLookupCache::new(geocoder, &cfg.cache);
        Self::with_cache(connector, cache, cfg)
    }

    /// Use an existing cache, shared with other clients of the process.
    ///
    pub fn with_cache(
        connector: Arc<dyn HubConnector>,
        cache: GeoLookupCache,
        cfg: &ClientConfig,
    ) -> Self {
        let connection = ChannelConnection::new(
            connector,
            cfg.reconnect.clone(),
            cfg.hub.connect_timeout(),
        );
        let pipeline = ReverseResolvePipeline::new(cache);
        let (latest, _) = watch::channel(None);
        let latest = Arc::new(latest);

        let (slot, resolver) = (latest.clone(), pipeline.clone());
        connection.on_receive(move |coord| {
            trace!("received {coord} from {}", coord.source_id());
            record(&slot, &resolver, coord);
        });

        CoordinateStreamClient {
            connection,
            pipeline,
            latest,
        }
    }

    /// Connect as `identity`, replacing the current session if the identity changed.
    ///
    pub async fn connect(&self, identity: &str) -> Result<(), ConnectError> {
        self.connection.connect(identity).await
    }

    /// Publish `coord` and, once the hub took it, make it our own latest coordinate.
    ///
    pub async fn send_coordinate(&self, coord: Coordinate) -> Result<(), SendError> {
        self.connection.send(&coord).await?;
        record(&self.latest, &self.pipeline, coord);
        Ok(())
    }

    pub async fn disconnect(&self) {
        info!("disconnecting");
        self.connection.stop().await;
    }

    pub fn identity(&self) -> Option<String> {
        self.connection.identity()
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn latest_coordinate(&self) -> Option<Coordinate> {
        self.latest.borrow().clone()
    }

    pub fn resolution(&self) -> Resolution {
        self.pipeline.resolution()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn subscribe_coordinate(&self) -> watch::Receiver<Option<Coordinate>> {
        self.latest.subscribe()
    }

    pub fn subscribe_resolution(&self) -> watch::Receiver<Resolution> {
        self.pipeline.subscribe()
    }

    /// Connection and cache counters together.
    ///
    pub fn stats(&self) -> Stats {
        self.connection.stats() + self.pipeline.cache().stats()
    }
}

fn record(
    slot: &watch::Sender<Option<Coordinate>>,
    pipeline: &ReverseResolvePipeline,
    coord: Coordinate,
) {
    slot.send_replace(Some(coord.clone()));
    pipeline.submit(coord);
}
