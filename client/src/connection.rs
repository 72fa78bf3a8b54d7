//! `ChannelConnection` owns the one logical connection to the hub.
//!
//! The connection is a small state machine (see [`ConnectionState`]) driven from two places:
//!
//! - the public operations `connect()`, `send()` and `stop()`, serialized through the `link`
//!   lock so there is never more than one transport being set up or torn down,
//! - one driver task per transport that reads inbound events in wire order, hands each
//!   coordinate to the registered handler and runs the reconnect policy when the transport
//!   drops.
//!
//! Each transport gets a generation number.  Tearing a transport down bumps the generation,
//! a driver whose generation is no longer current stops touching the shared state, which is
//! how a stale reconnect loop is kept from resurrecting a connection that was replaced or
//! stopped.
//!
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::{
    ConnectError, ConnectionState, Coordinate, HubConnector, HubEvent, HubSender, HubSession,
    LatLon, ReconnectPolicy, SendError, Stats,
};

/// Target for inbound coordinates.  Called on the dispatch path, it must not block.
///
pub type ReceiveHandler = Arc<dyn Fn(Coordinate) + Send + Sync>;

/// One live transport.
///
struct Link {
    identity: String,
    sender: Arc<dyn HubSender>,
    driver: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn HubConnector>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    link: tokio::sync::Mutex<Option<Link>>,
    /// Last identity given to `connect()`, kept after `stop()` so a send can revive it
    identity: Mutex<Option<String>>,
    generation: AtomicU64,
    handler: RwLock<Option<ReceiveHandler>>,
    stats: Mutex<Stats>,
}

pub struct ChannelConnection {
    inner: Arc<Inner>,
}

impl Debug for ChannelConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("connector", &self.inner.connector)
            .field("state", &self.state())
            .field("identity", &self.identity())
            .finish()
    }
}

impl ChannelConnection {
    #[tracing::instrument(skip(connector))]
    pub fn new(
        connector: Arc<dyn HubConnector>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ChannelConnection {
            inner: Arc::new(Inner {
                connector,
                policy,
                connect_timeout,
                state,
                link: tokio::sync::Mutex::new(None),
                identity: Mutex::new(None),
                generation: AtomicU64::new(0),
                handler: RwLock::new(None),
                stats: Mutex::new(Stats::default()),
            }),
        }
    }

    /// Current state, never blocks.
    ///
    #[inline]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Every transition is published here.
    ///
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn identity(&self) -> Option<String> {
        self.inner.identity.lock().ok().and_then(|id| id.clone())
    }

    pub fn stats(&self) -> Stats {
        self.inner
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Register the dispatch target for inbound coordinates, replacing any previous one.
    ///
    pub fn on_receive<F>(&self, handler: F)
    where
        F: Fn(Coordinate) + Send + Sync + 'static,
    {
        if let Ok(mut h) = self.inner.handler.write() {
            *h = Some(Arc::new(handler));
        }
    }

    /// Connect as `identity`.
    ///
    /// Already connected (or connecting) with the same identity is a no-op.  A different
    /// identity first stops the current transport completely.
    ///
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self, identity: &str) -> Result<(), ConnectError> {
        if self.identity().as_deref() == Some(identity)
            && matches!(
                self.state(),
                ConnectionState::Connected | ConnectionState::Connecting
            )
        {
            trace!("already connected as {identity}");
            return Ok(());
        }

        let mut link = self.inner.link.lock().await;

        // Someone may have done the work while we were waiting for the lock.
        //
        if let Some(l) = link.as_ref() {
            if l.identity == identity && self.state().is_connected() {
                return Ok(());
            }
            info!("replacing transport of {} for {identity}", l.identity);
        }
        self.inner.establish(&mut link, identity).await
    }

    /// Publish one coordinate.
    ///
    /// When not connected, one immediate reconnection is attempted before giving up with
    /// `SendError::NotConnected`.
    ///
    #[tracing::instrument(skip(self, coord), fields(coord = %coord))]
    pub async fn send(&self, coord: &Coordinate) -> Result<(), SendError> {
        let msg = LatLon {
            lat: coord.latitude(),
            lon: coord.longitude(),
            user_name: coord.source_id().to_owned(),
        };

        let sender = {
            let mut link = self.inner.link.lock().await;
            let state = self.state();
            let live = match link.as_ref() {
                Some(l) if state.is_connected() => Some(l.sender.clone()),
                _ => None,
            };
            match live {
                Some(sender) => sender,
                None => self.inner.revive(&mut link, state).await?,
            }
        };

        match sender.send_lat_lon(&msg).await {
            Ok(()) => {
                self.inner.bump(|s| s.sent += 1);
                trace!("sent");
                Ok(())
            }
            Err(e) => {
                warn!("send failed: {e}");
                self.inner.bump(|s| s.err += 1);
                Err(e)
            }
        }
    }

    /// Release the transport.  Stopping a stopped connection does nothing.
    ///
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        let mut link = self.inner.link.lock().await;
        if link.is_none() && self.state() == ConnectionState::Disconnected {
            trace!("already stopped");
            return;
        }
        self.inner.teardown(&mut link).await;
        self.inner.transition(ConnectionState::Disconnected);
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        // Best effort, the driver must not outlive us.
        //
        if let Ok(mut link) = self.inner.link.try_lock() {
            if let Some(old) = link.take() {
                old.driver.abort();
                if let Ok(rt) = Handle::try_current() {
                    let sender = old.sender;
                    rt.spawn(async move { sender.close().await });
                }
            }
        }
    }
}

impl Inner {
    fn bump(&self, f: impl FnOnce(&mut Stats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    #[inline]
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Apply a transition if it is a legal one.
    ///
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|cur| {
            if cur.can_become(next) {
                debug!("state {cur} -> {next}");
                *cur = next;
                true
            } else {
                if *cur != next {
                    trace!("ignoring {cur} -> {next}");
                }
                false
            }
        })
    }

    async fn open(&self, identity: &str) -> Result<HubSession, ConnectError> {
        match timeout(self.connect_timeout, self.connector.connect(identity)).await {
            Ok(res) => res,
            Err(_) => Err(ConnectError::Timeout),
        }
    }

    /// Full stop of the current transport, if any.
    ///
    async fn teardown(&self, link: &mut Option<Link>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = link.take() {
            trace!("tearing down transport of {}", old.identity);
            old.driver.abort();
            old.sender.close().await;
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn spawn_link(self: &Arc<Self>, identity: &str, session: HubSession) -> Link {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let driver = tokio::spawn(drive(
            self.clone(),
            generation,
            identity.to_owned(),
            session.events,
        ));
        Link {
            identity: identity.to_owned(),
            sender: session.sender,
            driver,
        }
    }

    /// Replace whatever we have with a fresh transport for `identity`.
    ///
    async fn establish(
        self: &Arc<Self>,
        link: &mut Option<Link>,
        identity: &str,
    ) -> Result<(), ConnectError> {
        self.teardown(link).await;
        if let Ok(mut id) = self.identity.lock() {
            *id = Some(identity.to_owned());
        }

        self.transition(ConnectionState::Connecting);
        match self.open(identity).await {
            Ok(session) => {
                *link = Some(self.spawn_link(identity, session));
                self.transition(ConnectionState::Connected);
                info!("connected as {identity}");
                Ok(())
            }
            Err(e) => {
                error!("can not connect as {identity}: {e}");
                self.bump(|s| s.err += 1);
                self.transition(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// One immediate reconnection on behalf of `send()`.
    ///
    async fn revive(
        self: &Arc<Self>,
        link: &mut Option<Link>,
        state: ConnectionState,
    ) -> Result<Arc<dyn HubSender>, SendError> {
        let identity = self
            .identity
            .lock()
            .ok()
            .and_then(|id| id.clone())
            .ok_or(SendError::NotConnected)?;
        warn!("{state} while sending, trying to reconnect once");

        if state == ConnectionState::Reconnecting {
            // The policy loop keeps running if this fails.
            //
            let session = self.open(&identity).await.map_err(|e| {
                debug!("immediate reconnect failed: {e}");
                SendError::NotConnected
            })?;
            if let Some(old) = link.take() {
                old.driver.abort();
                old.sender.close().await;
            }
            let new = self.spawn_link(&identity, session);
            let sender = new.sender.clone();
            *link = Some(new);
            self.bump(|s| s.reconnect += 1);
            self.transition(ConnectionState::Connected);
            return Ok(sender);
        }

        self.establish(link, &identity)
            .await
            .map_err(|_| SendError::NotConnected)?;
        link.as_ref()
            .map(|l| l.sender.clone())
            .ok_or(SendError::NotConnected)
    }

    /// Hand one inbound position to the handler.
    ///
    fn dispatch(&self, msg: LatLon) {
        match Coordinate::new(msg.lat, msg.lon, &msg.user_name) {
            Ok(coord) => {
                self.bump(|s| s.received += 1);
                let handler = self.handler.read().ok().and_then(|h| h.clone());
                match handler {
                    Some(h) => h(coord),
                    None => trace!("no handler for {coord}"),
                }
            }
            Err(e) => {
                warn!("invalid position from {:?}: {e}", msg.user_name);
                self.bump(|s| s.err += 1);
            }
        }
    }

    /// Run the reconnect policy after a transport loss.  Returns the new inbound stream, or
    /// `None` when this driver has nothing left to do.
    ///
    async fn recover(
        self: &Arc<Self>,
        generation: u64,
        identity: &str,
        reason: Option<String>,
    ) -> Option<UnboundedReceiver<HubEvent>> {
        {
            let _link = self.link.lock().await;
            if !self.is_current(generation) {
                return None;
            }
            warn!("transport lost ({}), reconnecting", reason.unwrap_or_default());
            self.transition(ConnectionState::Reconnecting);
        }

        let max = self.policy.max_attempts;
        for (n, delay) in self.policy.schedule().enumerate() {
            sleep(delay).await;
            if !self.is_current(generation) {
                return None;
            }

            info!("reconnect attempt {}/{max} as {identity}", n + 1);
            match self.open(identity).await {
                Ok(session) => {
                    let mut link = self.link.lock().await;
                    if !self.is_current(generation) {
                        session.sender.close().await;
                        return None;
                    }
                    if let Some(l) = link.as_mut() {
                        l.sender = session.sender;
                    }
                    self.bump(|s| s.reconnect += 1);
                    self.transition(ConnectionState::Connected);
                    info!("reconnected as {identity}");
                    return Some(session.events);
                }
                Err(e) => {
                    warn!("reconnect attempt {} failed: {e}", n + 1);
                    self.bump(|s| s.err += 1);
                }
            }
        }

        let _link = self.link.lock().await;
        if self.is_current(generation) {
            error!("giving up after {max} attempt(s)");
            self.transition(ConnectionState::Failed);
        }
        None
    }
}

/// Driver task: one per transport, exits when superseded or out of attempts.
///
async fn drive(
    inner: Arc<Inner>,
    generation: u64,
    identity: String,
    mut events: UnboundedReceiver<HubEvent>,
) {
    trace!("driver {generation} for {identity} starting");
    loop {
        let reason = loop {
            match events.recv().await {
                Some(HubEvent::LatLon(msg)) => inner.dispatch(msg),
                Some(HubEvent::Closed(reason)) => break reason,
                None => break None,
            }
        };

        match inner.recover(generation, &identity, reason).await {
            Some(ev) => events = ev,
            None => break,
        }
    }
    trace!("driver {generation} done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryHub;
    use rstest::rstest;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const WAIT: Duration = Duration::from_secs(5);

    fn policy(attempts: u32, delay_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms * 4,
            multiplier: 2.0,
        }
    }

    fn connection(hub: &MemoryHub, p: ReconnectPolicy) -> ChannelConnection {
        ChannelConnection::new(Arc::new(hub.clone()), p, Duration::from_secs(1))
    }

    fn collect(conn: &ChannelConnection) -> UnboundedReceiver<Coordinate> {
        let (tx, rx) = unbounded_channel();
        conn.on_receive(move |c| {
            let _ = tx.send(c);
        });
        rx
    }

    async fn wait_state(conn: &ChannelConnection, state: ConnectionState) {
        let mut rx = conn.subscribe();
        timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .expect("watch closed");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(2, 10));
        assert_eq!(ConnectionState::Disconnected, conn.state());

        conn.connect("a").await.unwrap();
        conn.connect("a").await.unwrap();

        assert_eq!(ConnectionState::Connected, conn.state());
        assert_eq!(1, hub.connects());
        assert_eq!(Some("a".to_string()), conn.identity());
    }

    #[rstest]
    #[case(23.78, 90.4)]
    #[case(-33.868_82, 151.209_296)]
    #[case(90.0, -180.0)]
    #[case(-0.000_001, 0.000_001)]
    #[tokio::test]
    async fn test_send_reaches_peer_unchanged(#[case] lat: f64, #[case] lon: f64) {
        let hub = MemoryHub::new();
        let a = connection(&hub, policy(2, 10));
        let b = connection(&hub, policy(2, 10));
        let mut rx = collect(&b);

        a.connect("a@example.com").await.unwrap();
        b.connect("b@example.com").await.unwrap();

        let c = Coordinate::new(lat, lon, "a@example.com").unwrap();
        a.send(&c).await.unwrap();

        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(lat, got.latitude());
        assert_eq!(lon, got.longitude());
        assert_eq!("a@example.com", got.source_id());
        assert_eq!(1, a.stats().sent);
        assert_eq!(1, b.stats().received);
    }

    #[tokio::test]
    async fn test_arrival_order_is_kept() {
        let hub = MemoryHub::new();
        let a = connection(&hub, policy(2, 10));
        let b = connection(&hub, policy(2, 10));
        let mut rx = collect(&b);
        a.connect("a").await.unwrap();
        b.connect("b").await.unwrap();

        for i in 0..20 {
            let c = Coordinate::new(i as f64, 0.0, "a").unwrap();
            a.send(&c).await.unwrap();
        }
        for i in 0..20 {
            let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(i as f64, got.latitude());
        }
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(2, 10));

        // Never connected
        //
        conn.stop().await;
        assert_eq!(ConnectionState::Disconnected, conn.state());

        conn.connect("a").await.unwrap();
        conn.stop().await;
        conn.stop().await;

        assert_eq!(ConnectionState::Disconnected, conn.state());
        assert_eq!(0, hub.sessions());
        assert_eq!(1, hub.closes());
    }

    #[tokio::test]
    async fn test_identity_change() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(2, 10));
        let peer = connection(&hub, policy(2, 10));
        let mut rx = collect(&conn);

        conn.connect("a").await.unwrap();
        peer.connect("peer").await.unwrap();
        conn.connect("b").await.unwrap();

        assert_eq!(ConnectionState::Connected, conn.state());
        assert_eq!(3, hub.connects());
        assert_eq!(1, hub.closes());
        assert_eq!(vec!["peer".to_string(), "b".to_string()], hub.identities());

        // Exactly one delivery: the old subscription is gone.
        //
        peer.send(&Coordinate::new(1.0, 2.0, "peer").unwrap())
            .await
            .unwrap();
        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(1.0, got.latitude());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let hub = MemoryHub::new();
        hub.refuse_next(1);
        let conn = connection(&hub, policy(2, 10));

        let err = conn.connect("a").await.unwrap_err();
        assert!(matches!(err, ConnectError::Network(_)));
        assert_eq!(ConnectionState::Failed, conn.state());

        // Can try again from Failed
        //
        conn.connect("a").await.unwrap();
        assert_eq!(ConnectionState::Connected, conn.state());
    }

    #[tokio::test]
    async fn test_reconnect_after_drop() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(3, 50));
        conn.connect("a").await.unwrap();

        hub.drop_all();
        wait_state(&conn, ConnectionState::Reconnecting).await;
        wait_state(&conn, ConnectionState::Connected).await;

        assert_eq!(2, hub.connects());
        assert_eq!(1, conn.stats().reconnect);
    }

    #[tokio::test]
    async fn test_reconnect_exhausted() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(2, 10));
        conn.connect("a").await.unwrap();

        hub.refuse_next(10);
        hub.drop_all();
        wait_state(&conn, ConnectionState::Failed).await;
        assert_eq!(1, hub.connects());

        // stop() from Failed
        //
        conn.stop().await;
        assert_eq!(ConnectionState::Disconnected, conn.state());
    }

    #[tokio::test]
    async fn test_send_never_connected() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(2, 10));

        let c = Coordinate::new(1.0, 2.0, "a").unwrap();
        assert_eq!(Err(SendError::NotConnected), conn.send(&c).await);
        assert_eq!(0, hub.connects());
    }

    #[tokio::test]
    async fn test_send_revives_failed_connection() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(1, 10));
        conn.connect("a").await.unwrap();

        hub.refuse_next(1);
        hub.drop_all();
        wait_state(&conn, ConnectionState::Failed).await;

        let c = Coordinate::new(1.0, 2.0, "a").unwrap();
        conn.send(&c).await.unwrap();
        assert_eq!(ConnectionState::Connected, conn.state());
    }

    #[tokio::test]
    async fn test_send_while_reconnecting() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(3, 2_000));
        conn.connect("a").await.unwrap();

        hub.drop_all();
        wait_state(&conn, ConnectionState::Reconnecting).await;

        let c = Coordinate::new(1.0, 2.0, "a").unwrap();
        conn.send(&c).await.unwrap();
        assert_eq!(ConnectionState::Connected, conn.state());
        assert_eq!(1, hub.sessions());
    }

    /// Hub that takes its time to accept, so a reconnect attempt can be overtaken.
    ///
    #[derive(Debug)]
    struct SlowHub {
        hub: MemoryHub,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl HubConnector for SlowHub {
        async fn connect(&self, identity: &str) -> Result<HubSession, ConnectError> {
            sleep(self.delay).await;
            self.hub.connect(identity).await
        }
    }

    #[tokio::test]
    async fn test_send_overtaking_reconnect_keeps_one_session() {
        let hub = MemoryHub::new();
        let slow = SlowHub {
            hub: hub.clone(),
            delay: Duration::from_millis(200),
        };
        let conn = ChannelConnection::new(Arc::new(slow), policy(3, 10), Duration::from_secs(1));
        conn.connect("a").await.unwrap();

        // The policy loop is now inside its first (slow) attempt.
        //
        hub.drop_all();
        wait_state(&conn, ConnectionState::Reconnecting).await;
        sleep(Duration::from_millis(50)).await;

        let c = Coordinate::new(1.0, 2.0, "a").unwrap();
        conn.send(&c).await.unwrap();

        // Let the superseded attempt finish and be discarded.
        //
        sleep(Duration::from_millis(400)).await;
        assert_eq!(ConnectionState::Connected, conn.state());
        assert_eq!(vec!["a".to_string()], hub.identities());
    }

    #[tokio::test]
    async fn test_stop_during_reconnect_attempt() {
        let hub = MemoryHub::new();
        let slow = SlowHub {
            hub: hub.clone(),
            delay: Duration::from_millis(100),
        };
        let conn = ChannelConnection::new(Arc::new(slow), policy(3, 10), Duration::from_secs(1));
        conn.connect("a").await.unwrap();

        hub.drop_all();
        wait_state(&conn, ConnectionState::Reconnecting).await;
        conn.stop().await;

        sleep(Duration::from_millis(300)).await;
        assert_eq!(ConnectionState::Disconnected, conn.state());
        assert_eq!(0, hub.sessions());
    }

    #[tokio::test]
    async fn test_send_after_stop_fails_when_hub_refuses() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(1, 10));
        conn.connect("a").await.unwrap();
        conn.stop().await;

        hub.refuse_next(1);
        let c = Coordinate::new(1.0, 2.0, "a").unwrap();
        assert_eq!(Err(SendError::NotConnected), conn.send(&c).await);
        assert_eq!(ConnectionState::Failed, conn.state());
    }

    #[tokio::test]
    async fn test_send_rejected() {
        let hub = MemoryHub::new();
        let conn = connection(&hub, policy(1, 10));
        conn.connect("a").await.unwrap();
        hub.reject_sends(true);

        let c = Coordinate::new(1.0, 2.0, "a").unwrap();
        assert!(matches!(
            conn.send(&c).await,
            Err(SendError::TransportRejected(_))
        ));
        assert_eq!(1, conn.stats().err);
    }
}
