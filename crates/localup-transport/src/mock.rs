//! Deterministic in-memory transport fakes
//!
//! Enabled for this crate's own tests and for downstream crates through the
//! `mock` feature. A [`pair`] hands out the agent side of a connection
//! together with a [`MockPeer`] the test drives as the remote proxy.

use super::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{watch, Notify};

/// Build a connected pair: the agent's [`Connection`] and the test's peer
pub fn pair(principals: Vec<String>) -> (Connection, MockPeer) {
    let (requests_tx, requests_rx) = mpsc::channel(16);
    let (channels_tx, channels_rx) = mpsc::channel(16);
    let conn = Arc::new(MockConnection::new(principals));

    let connection = Connection {
        handle: conn.clone(),
        requests: requests_rx,
        channels: channels_rx,
    };

    let peer = MockPeer {
        conn,
        requests: Mutex::new(Some(requests_tx)),
        channels: channels_tx,
    };

    (connection, peer)
}

/// The proxy side of a mock connection
#[derive(Debug)]
pub struct MockPeer {
    pub conn: Arc<MockConnection>,
    requests: Mutex<Option<mpsc::Sender<Request>>>,
    channels: mpsc::Sender<Box<dyn NewChannel>>,
}

impl MockPeer {
    /// Send a global request to the agent
    pub async fn send_request(
        &self,
        kind: &str,
        want_reply: bool,
    ) -> TransportResult<Option<oneshot::Receiver<RequestReply>>> {
        let tx = self
            .requests
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;
        let (req, rx) = Request::new(kind, want_reply, Bytes::new());
        tx.send(req)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(rx)
    }

    /// Close the global request stream, as a peer disconnect would
    pub fn hang_up(&self) {
        self.requests.lock().unwrap().take();
    }

    /// Ask the agent to accept a channel. Resolves to whether it was accepted.
    pub async fn open_channel(&self, kind: &str) -> TransportResult<oneshot::Receiver<bool>> {
        let (decision_tx, decision_rx) = oneshot::channel();
        let channel = MockNewChannel {
            kind: kind.to_string(),
            decision: decision_tx,
            conn_closed: self.conn.closed.clone(),
        };
        self.channels
            .send(Box::new(channel))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(decision_rx)
    }
}

/// Counters shared by every channel the agent opens on a mock connection
#[derive(Debug)]
struct ChannelLog {
    requests: Mutex<Vec<(String, bool)>>,
    count: watch::Sender<usize>,
    closed: AtomicUsize,
    fail: AtomicBool,
    // Keeps the channel request streams open for the life of the connection.
    peers: Mutex<Vec<mpsc::Sender<Request>>>,
}

impl ChannelLog {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            requests: Mutex::new(Vec::new()),
            count,
            closed: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            peers: Mutex::new(Vec::new()),
        }
    }
}

/// The agent side of a mock connection
#[derive(Debug)]
pub struct MockConnection {
    principals: Mutex<Vec<String>>,
    closed: Arc<AtomicBool>,
    close_calls: AtomicUsize,
    opened: Mutex<Vec<String>>,
    open_gate: Mutex<Option<Arc<Notify>>>,
    close_gate: Mutex<Option<Arc<Notify>>>,
    fail_open: AtomicBool,
    log: Arc<ChannelLog>,
}

impl MockConnection {
    fn new(principals: Vec<String>) -> Self {
        Self {
            principals: Mutex::new(principals),
            closed: Arc::new(AtomicBool::new(false)),
            close_calls: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
            open_gate: Mutex::new(None),
            close_gate: Mutex::new(None),
            fail_open: AtomicBool::new(false),
            log: Arc::new(ChannelLog::new()),
        }
    }

    /// Replace the principals presented to the agent
    pub fn set_principals(&self, principals: Vec<String>) {
        *self.principals.lock().unwrap() = principals;
    }

    /// Make `open_channel` block until the returned gate is notified
    pub fn hold_channel_open(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.open_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Make `close` block until the returned gate is notified
    pub fn hold_close(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.close_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Make `open_channel` fail
    pub fn fail_channel_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    /// Make every further channel request fail, as a dropped link would
    pub fn break_channels(&self) {
        self.log.fail.store(true, Ordering::SeqCst);
    }

    /// Channel types opened by the agent, in order
    pub fn opened_channels(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    /// Channel requests sent by the agent as `(name, want_reply)`
    pub fn channel_requests(&self) -> Vec<(String, bool)> {
        self.log.requests.lock().unwrap().clone()
    }

    /// Number of channel requests sent so far
    pub fn channel_request_count(&self) -> usize {
        *self.log.count.borrow()
    }

    /// Wait until at least `count` channel requests were sent
    pub async fn wait_for_channel_requests(&self, count: usize) {
        let mut rx = self.log.count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// Number of times the agent closed one of its channels
    pub fn channel_closes(&self) -> usize {
        self.log.closed.load(Ordering::SeqCst)
    }

    /// Number of `close` calls, including redundant ones
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecureConnection for MockConnection {
    fn principals(&self) -> Vec<String> {
        self.principals.lock().unwrap().clone()
    }

    async fn open_channel(
        &self,
        kind: &str,
        _data: Bytes,
    ) -> TransportResult<(Box<dyn Channel>, RequestStream)> {
        let gate = self.open_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelRejected {
                kind: kind.to_string(),
                reason: "administratively prohibited".to_string(),
            });
        }

        self.opened.lock().unwrap().push(kind.to_string());

        let (tx, rx) = mpsc::channel(4);
        self.log.peers.lock().unwrap().push(tx);

        let channel = MockChannel {
            log: self.log.clone(),
            conn_closed: self.closed.clone(),
            closed: false,
        };
        Ok((Box::new(channel), rx))
    }

    async fn close(&self) -> TransportResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.close_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.log.peers.lock().unwrap().clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> String {
        "mock-proxy:3024".to_string()
    }
}

/// A channel opened over a [`MockConnection`]
#[derive(Debug)]
pub struct MockChannel {
    log: Arc<ChannelLog>,
    conn_closed: Arc<AtomicBool>,
    closed: bool,
}

impl MockChannel {
    fn check_open(&self) -> TransportResult<()> {
        if self.closed || self.conn_closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        if self.log.fail.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "broken pipe".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn send_request(
        &mut self,
        name: &str,
        want_reply: bool,
        _payload: Bytes,
    ) -> TransportResult<bool> {
        self.check_open()?;
        self.log
            .requests
            .lock()
            .unwrap()
            .push((name.to_string(), want_reply));
        self.log.count.send_modify(|n| *n += 1);
        Ok(true)
    }

    async fn send_bytes(&mut self, _data: &[u8]) -> TransportResult<()> {
        self.check_open()
    }

    async fn recv_bytes(&mut self, _max_size: usize) -> TransportResult<Bytes> {
        if self.check_open().is_err() {
            return Ok(Bytes::new());
        }
        Ok(Bytes::from_static(b"test data"))
    }

    async fn close(&mut self) -> TransportResult<()> {
        if !self.closed {
            self.closed = true;
            self.log.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// A channel-open request sent by a [`MockPeer`]
#[derive(Debug)]
pub struct MockNewChannel {
    kind: String,
    decision: oneshot::Sender<bool>,
    conn_closed: Arc<AtomicBool>,
}

#[async_trait]
impl NewChannel for MockNewChannel {
    fn channel_type(&self) -> &str {
        &self.kind
    }

    async fn accept(self: Box<Self>) -> TransportResult<(Box<dyn Channel>, RequestStream)> {
        let _ = self.decision.send(true);
        let (_tx, rx) = mpsc::channel(1);
        let channel = MockChannel {
            log: Arc::new(ChannelLog::new()),
            conn_closed: self.conn_closed,
            closed: false,
        };
        Ok((Box::new(channel), rx))
    }

    async fn reject(self: Box<Self>, _reason: &str) -> TransportResult<()> {
        let _ = self.decision.send(false);
        Ok(())
    }
}

type DialFn = dyn Fn(&str) -> TransportResult<Connection> + Send + Sync;

/// Dialer handing out queued connections, or building them on demand
pub struct MockDialer {
    queue: Mutex<VecDeque<TransportResult<Connection>>>,
    factory: Option<Box<DialFn>>,
    stall: bool,
    dials: AtomicUsize,
}

impl MockDialer {
    /// Dial succeeds once with `conn`, then fails
    pub fn with_connection(conn: Connection) -> Self {
        Self::with_results(vec![Ok(conn)])
    }

    /// Dial returns the queued results in order, then fails
    pub fn with_results(results: Vec<TransportResult<Connection>>) -> Self {
        Self {
            queue: Mutex::new(results.into()),
            factory: None,
            stall: false,
            dials: AtomicUsize::new(0),
        }
    }

    /// Every dial calls `factory`
    pub fn from_fn<F>(factory: F) -> Self
    where
        F: Fn(&str) -> TransportResult<Connection> + Send + Sync + 'static,
    {
        Self {
            queue: Mutex::new(VecDeque::new()),
            factory: Some(Box::new(factory)),
            stall: false,
            dials: AtomicUsize::new(0),
        }
    }

    /// Every dial hangs forever
    pub fn stalled() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            factory: None,
            stall: true,
            dials: AtomicUsize::new(0),
        }
    }

    /// Number of dial attempts so far
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, addr: &str) -> TransportResult<Connection> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        if self.stall {
            std::future::pending::<()>().await;
        }
        if let Some(factory) = &self.factory {
            return factory(addr);
        }

        let next = self.queue.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Err(TransportError::ConnectionError(format!(
                "connection refused: {}",
                addr
            )))
        })
    }
}

/// Transport factory whose transports idle until cancelled
#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    built: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl MockTransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transports built
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    /// Number of transports that finished serving
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl TransportBuilder for MockTransportBuilder {
    fn build(
        &self,
        cancel: CancellationToken,
        channel: Box<dyn Channel>,
        _requests: RequestStream,
        _conn: Arc<dyn SecureConnection>,
    ) -> Box<dyn TunnelTransport> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Box::new(IdleTransport {
            cancel,
            channel,
            finished: self.finished.clone(),
        })
    }
}

struct IdleTransport {
    cancel: CancellationToken,
    channel: Box<dyn Channel>,
    finished: Arc<AtomicUsize>,
}

#[async_trait]
impl TunnelTransport for IdleTransport {
    async fn serve(mut self: Box<Self>) {
        self.cancel.cancelled().await;
        let _ = self.channel.close().await;
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test_mock {
    use super::*;

    #[tokio::test]
    async fn test_pair_global_request_roundtrip() {
        let (mut conn, peer) = pair(vec!["proxy-1".to_string()]);

        let rx = peer.send_request("version", true).await.unwrap().unwrap();
        let req = conn.requests.recv().await.unwrap();
        assert_eq!(req.kind, "version");
        req.reply(true, Bytes::from_static(b"v1")).unwrap();

        let reply = rx.await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.payload, Bytes::from_static(b"v1"));
    }

    #[tokio::test]
    async fn test_hang_up_closes_request_stream() {
        let (mut conn, peer) = pair(Vec::new());
        peer.hang_up();
        assert!(conn.requests.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_requests_recorded() {
        let (conn, peer) = pair(Vec::new());

        let (mut channel, _reqs) = conn
            .handle
            .open_channel("heartbeat", Bytes::new())
            .await
            .unwrap();
        channel
            .send_request("ping", false, Bytes::new())
            .await
            .unwrap();

        peer.conn.wait_for_channel_requests(1).await;
        assert_eq!(peer.conn.opened_channels(), vec!["heartbeat"]);
        assert_eq!(
            peer.conn.channel_requests(),
            vec![("ping".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_channel_fails_after_close() {
        let (conn, _peer) = pair(Vec::new());

        let (mut channel, _reqs) = conn
            .handle
            .open_channel("heartbeat", Bytes::new())
            .await
            .unwrap();
        conn.handle.close().await.unwrap();

        let result = channel.send_request("ping", false, Bytes::new()).await;
        assert!(matches!(result, Err(TransportError::ChannelClosed)));

        // Second close reports the connection already closed
        assert!(conn.handle.close().await.is_err());
    }

    #[tokio::test]
    async fn test_fail_channel_open() {
        let (conn, peer) = pair(Vec::new());
        peer.conn.fail_channel_open();

        let result = conn.handle.open_channel("heartbeat", Bytes::new()).await;
        assert!(matches!(
            result,
            Err(TransportError::ChannelRejected { .. })
        ));
        assert!(peer.conn.opened_channels().is_empty());
    }

    #[tokio::test]
    async fn test_dialer_queue_then_refused() {
        let (conn, _peer) = pair(Vec::new());
        let dialer = MockDialer::with_connection(conn);

        assert!(dialer.dial("proxy:3024").await.is_ok());
        assert!(dialer.dial("proxy:3024").await.is_err());
        assert_eq!(dialer.dial_count(), 2);
    }
}
