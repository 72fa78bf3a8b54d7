//! SignalR JSON hub protocol over a WebSocket.
//!
//! Negotiation is skipped, we talk to the WebSocket endpoint directly:
//!
//! 1. send the handshake `{"protocol":"json","version":1}<RS>` and wait for `{}<RS>`,
//! 2. publish with an invocation frame (type 1) on `SendLatLon`, the hub acknowledges with a
//!    completion frame (type 3) carrying the same `invocationId`,
//! 3. positions from the other parties arrive as `ReceiveLatLon` invocations,
//! 4. ping frames (type 6) are ignored, a close frame (type 7) ends the session.
//!
//! Every record is terminated by the ASCII record separator `0x1E`, a single WebSocket
//! message can hold several records.
//!
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::{HubConnector, HubEvent, HubSender, HubSession, LatLon, RECEIVE_TARGET, SEND_TARGET};
use crate::{ConnectError, HubConfig, SendError};

/// Record separator
pub(crate) const RS: char = '\u{1e}';

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<Waiters>>;

/// Invocations waiting for their completion frame.
///
#[derive(Default)]
struct Waiters {
    open: HashMap<String, oneshot::Sender<Option<String>>>,
    /// Set by the reader on its way out, nothing will complete after that
    closed: bool,
}

/// Opens SignalR sessions on a hub URL.
///
#[derive(Clone, Debug)]
pub struct SignalRConnector {
    url: String,
    connect_timeout: Duration,
    invoke_timeout: Duration,
}

impl SignalRConnector {
    #[tracing::instrument]
    pub fn new(url: &str) -> Self {
        Self::from_config(&HubConfig {
            url: url.to_owned(),
            ..HubConfig::default()
        })
    }

    #[tracing::instrument]
    pub fn from_config(cfg: &HubConfig) -> Self {
        SignalRConnector {
            url: cfg.url.clone(),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            invoke_timeout: Duration::from_millis(cfg.invoke_timeout_ms),
        }
    }

    /// WebSocket URL for the hub, `http(s)` becomes `ws(s)`.
    ///
    pub fn ws_url(&self) -> String {
        if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.url.clone()
        }
    }
}

#[async_trait]
impl HubConnector for SignalRConnector {
    #[tracing::instrument(skip(self))]
    async fn connect(&self, identity: &str) -> Result<HubSession, ConnectError> {
        let url = self.ws_url();
        trace!("signalr::connect({url})");

        let (ws, _resp) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(|e| ConnectError::Network(e.to_string()))?;

        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(handshake()))
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;
        let leftover = timeout(self.connect_timeout, read_handshake(&mut stream))
            .await
            .map_err(|_| ConnectError::Timeout)??;
        debug!("handshake done for {identity}");

        let pending: Pending = Arc::new(Mutex::new(Waiters::default()));
        let (tx, rx) = unbounded_channel();
        let reader = tokio::spawn(read_loop(stream, tx, pending.clone(), leftover));

        let sender = SignalRSender {
            sink: tokio::sync::Mutex::new(sink),
            pending,
            next_id: AtomicU64::new(0),
            invoke_timeout: self.invoke_timeout,
            reader: reader.abort_handle(),
        };
        Ok(HubSession {
            sender: Arc::new(sender),
            events: rx,
        })
    }
}

struct SignalRSender {
    sink: tokio::sync::Mutex<SplitSink<Ws, Message>>,
    pending: Pending,
    next_id: AtomicU64,
    invoke_timeout: Duration,
    reader: AbortHandle,
}

impl SignalRSender {
    fn forget(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.open.remove(id);
        }
    }
}

#[async_trait]
impl HubSender for SignalRSender {
    async fn send_lat_lon(&self, msg: &LatLon) -> Result<(), SendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().map_err(|_| SendError::NotConnected)?;
            if pending.closed || self.reader.is_finished() {
                trace!("reader gone, not sending");
                return Err(SendError::NotConnected);
            }
            pending.open.insert(id.clone(), tx);
        }

        let frame = invocation(&id, msg);
        trace!("invoke {frame}");
        if let Err(e) = self.sink.lock().await.send(Message::Text(frame)).await {
            debug!("send failed: {e}");
            self.forget(&id);
            return Err(SendError::NotConnected);
        }

        match timeout(self.invoke_timeout, rx).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(err))) => Err(SendError::TransportRejected(err)),
            // Reader is gone, so is the connection
            Ok(Err(_)) => Err(SendError::NotConnected),
            Err(_) => {
                self.forget(&id);
                Err(SendError::TransportRejected("no acknowledgement".into()))
            }
        }
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        self.reader.abort();
    }
}

impl Drop for SignalRSender {
    fn drop(&mut self) {
        // The reader owns the other half of the socket.
        //
        self.reader.abort();
    }
}

/// Wait for the handshake answer, return whatever records came along with it.
///
async fn read_handshake(stream: &mut SplitStream<Ws>) -> Result<Vec<String>, ConnectError> {
    loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(other)) => {
                return Err(ConnectError::Protocol(format!(
                    "unexpected handshake message: {other:?}"
                )))
            }
            Some(Err(e)) => return Err(ConnectError::Network(e.to_string())),
            None => {
                return Err(ConnectError::Network(
                    "connection closed during handshake".into(),
                ))
            }
        };

        let mut recs = records(&text);
        let Some(first) = recs.next() else {
            continue;
        };
        let answer: Value =
            serde_json::from_str(first).map_err(|e| ConnectError::Protocol(e.to_string()))?;
        if let Some(err) = answer.get("error").and_then(Value::as_str) {
            return Err(ConnectError::Protocol(err.to_owned()));
        }
        return Ok(recs.map(String::from).collect());
    }
}

async fn read_loop(
    mut stream: SplitStream<Ws>,
    tx: UnboundedSender<HubEvent>,
    pending: Pending,
    leftover: Vec<String>,
) {
    let mut reason = None;
    let mut open = true;

    for rec in &leftover {
        if let Some(r) = dispatch(rec, &tx, &pending) {
            reason = r;
            open = false;
            break;
        }
    }

    while open {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                reason = frame.map(|f| f.reason.to_string());
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                reason = Some(e.to_string());
                break;
            }
            None => break,
        };

        for rec in records(&text) {
            if let Some(r) = dispatch(rec, &tx, &pending) {
                reason = r;
                open = false;
                break;
            }
        }
    }

    debug!("hub session closed: {reason:?}");

    // Waiters see their oneshot dropped and report `NotConnected`.
    //
    if let Ok(mut pending) = pending.lock() {
        pending.closed = true;
        pending.open.clear();
    }
    let _ = tx.send(HubEvent::Closed(reason));
}

/// Handle one inbound record, `Some(reason)` means the hub closed the session.
///
fn dispatch(rec: &str, tx: &UnboundedSender<HubEvent>, pending: &Pending) -> Option<Option<String>> {
    match parse_record(rec) {
        Ok(Record::Event(ll)) => {
            let _ = tx.send(HubEvent::LatLon(ll));
        }
        Ok(Record::Completion { id, error }) => {
            let waiter = pending.lock().ok().and_then(|mut p| p.open.remove(&id));
            match waiter {
                Some(w) => {
                    let _ = w.send(error);
                }
                None => trace!("completion for unknown invocation {id}"),
            }
        }
        Ok(Record::Close(reason)) => return Some(reason),
        Ok(Record::Ping) | Ok(Record::Ignored) => {}
        Err(e) => warn!("bad hub record {rec:?}: {e}"),
    }
    None
}

/// Decoded inbound record.
///
#[derive(Debug, PartialEq)]
pub(crate) enum Record {
    Event(LatLon),
    Completion { id: String, error: Option<String> },
    Ping,
    Close(Option<String>),
    Ignored,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    kind: u8,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    invocation_id: Option<String>,
    error: Option<String>,
}

pub(crate) fn parse_record(rec: &str) -> Result<Record, String> {
    let env: Envelope = serde_json::from_str(rec).map_err(|e| e.to_string())?;
    let rec = match env.kind {
        1 if env.target.as_deref() == Some(RECEIVE_TARGET) => {
            Record::Event(lat_lon_from(&env.arguments)?)
        }
        3 => Record::Completion {
            id: env.invocation_id.unwrap_or_default(),
            error: env.error,
        },
        6 => Record::Ping,
        7 => Record::Close(env.error),
        _ => Record::Ignored,
    };
    Ok(rec)
}

/// `ReceiveLatLon` comes either as `[lat, lon, userName]` or as `[{lat, lon, userName}]`.
///
fn lat_lon_from(args: &[Value]) -> Result<LatLon, String> {
    match args {
        [Value::Object(_), ..] => serde_json::from_value(args[0].clone()).map_err(|e| e.to_string()),
        [lat, lon, rest @ ..] => {
            let lat = lat.as_f64().ok_or("latitude is not a number")?;
            let lon = lon.as_f64().ok_or("longitude is not a number")?;
            let user_name = rest
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            Ok(LatLon { lat, lon, user_name })
        }
        _ => Err(format!("bad {RECEIVE_TARGET} arguments: {args:?}")),
    }
}

pub(crate) fn records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RS).filter(|r| !r.trim().is_empty())
}

pub(crate) fn handshake() -> String {
    format!("{}{RS}", json!({"protocol": "json", "version": 1}))
}

pub(crate) fn invocation(id: &str, msg: &LatLon) -> String {
    let frame = json!({
        "type": 1,
        "invocationId": id,
        "target": SEND_TARGET,
        "arguments": [msg.lat, msg.lon, msg.user_name],
    });
    format!("{frame}{RS}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn dhaka() -> LatLon {
        LatLon {
            lat: 23.78,
            lon: 90.4,
            user_name: "a@example.com".into(),
        }
    }

    #[rstest]
    #[case("https://tech-test.raintor.com/Hub", "wss://tech-test.raintor.com/Hub")]
    #[case("http://localhost:5000/Hub", "ws://localhost:5000/Hub")]
    #[case("ws://localhost/Hub", "ws://localhost/Hub")]
    fn test_ws_url(#[case] url: &str, #[case] ws: &str) {
        assert_eq!(ws, SignalRConnector::new(url).ws_url());
    }

    #[test]
    fn test_records_split() {
        let text = format!("{{}}{RS}{{\"type\":6}}{RS}");
        let recs: Vec<_> = records(&text).collect();
        assert_eq!(vec!["{}", "{\"type\":6}"], recs);
    }

    #[test]
    fn test_invocation_frame() {
        let frame = invocation("7", &dhaka());
        assert!(frame.ends_with(RS));

        let v: Value = serde_json::from_str(frame.trim_end_matches(RS)).unwrap();
        assert_eq!(1, v["type"]);
        assert_eq!("7", v["invocationId"]);
        assert_eq!(SEND_TARGET, v["target"]);
        assert_eq!(json!([23.78, 90.4, "a@example.com"]), v["arguments"]);
    }

    #[rstest]
    #[case(r#"{"type":1,"target":"ReceiveLatLon","arguments":[23.78,90.4,"a@example.com"]}"#)]
    #[case(r#"{"type":1,"target":"ReceiveLatLon","arguments":[{"lat":23.78,"lon":90.4,"userName":"a@example.com"}]}"#)]
    fn test_parse_receive(#[case] rec: &str) {
        assert_eq!(Ok(Record::Event(dhaka())), parse_record(rec));
    }

    #[test]
    fn test_parse_receive_without_user() {
        let rec = r#"{"type":1,"target":"ReceiveLatLon","arguments":[{"lat":1.5,"lon":2.5}]}"#;
        let Ok(Record::Event(ll)) = parse_record(rec) else {
            panic!("not an event");
        };
        assert_eq!("", ll.user_name);
    }

    #[rstest]
    #[case(r#"{"type":3,"invocationId":"4"}"#, Record::Completion { id: "4".into(), error: None })]
    #[case(r#"{"type":3,"invocationId":"5","error":"boom"}"#, Record::Completion { id: "5".into(), error: Some("boom".into()) })]
    #[case(r#"{"type":6}"#, Record::Ping)]
    #[case(r#"{"type":7,"error":"server going down"}"#, Record::Close(Some("server going down".into())))]
    #[case(r#"{"type":1,"target":"SomethingElse","arguments":[]}"#, Record::Ignored)]
    fn test_parse_other(#[case] rec: &str, #[case] expected: Record) {
        assert_eq!(Ok(expected), parse_record(rec));
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"type":1,"target":"ReceiveLatLon","arguments":["north",90.4]}"#)]
    #[case(r#"{"type":1,"target":"ReceiveLatLon","arguments":[]}"#)]
    fn test_parse_bad(#[case] rec: &str) {
        assert!(parse_record(rec).is_err());
    }

    /// Minimal hub: handshake, acknowledge one invocation, echo it back as `ReceiveLatLon`
    /// in the same message then close.
    ///
    async fn fake_hub(answer: &'static str) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let h = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let hello = ws.next().await.unwrap().unwrap();
            assert!(hello.to_text().unwrap().contains("\"protocol\":\"json\""));
            ws.send(Message::Text(format!("{answer}{RS}"))).await.unwrap();

            let Some(Ok(msg)) = ws.next().await else {
                return;
            };
            let text = msg.into_text().unwrap();
            let v: Value = serde_json::from_str(text.trim_end_matches(RS)).unwrap();
            let id = v["invocationId"].as_str().unwrap().to_string();
            let args = v["arguments"].clone();

            let ack = json!({"type": 3, "invocationId": id});
            let echo = json!({
                "type": 1,
                "target": RECEIVE_TARGET,
                "arguments": [{"lat": args[0], "lon": args[1], "userName": args[2]}],
            });
            ws.send(Message::Text(format!("{ack}{RS}{echo}{RS}")))
                .await
                .unwrap();
            let _ = ws.close(None).await;
        });
        (format!("http://{addr}/Hub"), h)
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let (url, h) = fake_hub("{}").await;
        let conn = SignalRConnector::new(&url);

        let mut session = conn.connect("a@example.com").await.unwrap();
        session.sender.send_lat_lon(&dhaka()).await.unwrap();

        assert_eq!(Some(HubEvent::LatLon(dhaka())), session.events.recv().await);
        assert!(matches!(
            session.events.recv().await,
            Some(HubEvent::Closed(_))
        ));
        h.await.unwrap();
    }

    /// Hub that completes the handshake then goes away.
    ///
    async fn vanishing_hub() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let _hello = ws.next().await;
            ws.send(Message::Text(format!("{{}}{RS}"))).await.unwrap();
            let _ = ws.close(None).await;
            while let Some(Ok(_)) = ws.next().await {}
        });
        format!("http://{addr}/Hub")
    }

    #[tokio::test]
    async fn test_send_after_hub_closed() {
        let url = vanishing_hub().await;
        let conn = SignalRConnector::from_config(&HubConfig {
            url,
            invoke_timeout_ms: 10_000,
            ..HubConfig::default()
        });

        let mut session = conn.connect("a@example.com").await.unwrap();
        assert!(matches!(
            session.events.recv().await,
            Some(HubEvent::Closed(_))
        ));

        // Must not wait for an acknowledgement that can not come.
        //
        let res = timeout(Duration::from_secs(2), session.sender.send_lat_lon(&dhaka()))
            .await
            .expect("send waited for the invoke timeout");
        assert_eq!(Err(SendError::NotConnected), res);
    }

    #[tokio::test]
    async fn test_dropped_session_stops_reader() {
        let (url, _h) = fake_hub("{}").await;
        let conn = SignalRConnector::new(&url);

        let HubSession { sender, mut events } = conn.connect("a@example.com").await.unwrap();
        drop(sender);

        // Reader aborted: the event channel closes without a `Closed` event.
        //
        let ev = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(None, ev);
    }

    #[tokio::test]
    async fn test_handshake_error() {
        let (url, _h) = fake_hub(r#"{"error":"Requested protocol 'json' is not available."}"#).await;
        let conn = SignalRConnector::new(&url);

        let err = conn.connect("a@example.com").await.unwrap_err();
        assert!(matches!(err, ConnectError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port and release it
        //
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = SignalRConnector::new(&format!("http://{addr}/Hub"));
        let err = conn.connect("a@example.com").await.unwrap_err();
        assert!(matches!(err, ConnectError::Network(_)));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Accepts TCP but never speaks WebSocket
        //
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _h = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let conn = SignalRConnector::from_config(&HubConfig {
            url: format!("http://{addr}/Hub"),
            connect_timeout_ms: 100,
            ..HubConfig::default()
        });
        assert_eq!(
            ConnectError::Timeout,
            conn.connect("a@example.com").await.unwrap_err()
        );
    }
}
