/// Integration tests for the agent pool
///
/// The pool must keep one connected agent per lease, redial after an agent
/// closes and never hold two agents on the same proxy.
use localup_agent::{
    AgentEvent, AgentPool, AgentPoolConfig, AgentState, ReconnectConfig, StaticVersion,
};
use localup_transport::mock::{pair, MockDialer, MockPeer, MockTransportBuilder};
use localup_transport::TransportError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Dialer handing out a fresh mock proxy per dial
///
/// `principals` picks the proxy identity for the n-th dial (zero based);
/// `None` makes that dial fail.
fn proxy_dialer<F>(principals: F) -> (Arc<MockDialer>, Arc<Mutex<Vec<MockPeer>>>)
where
    F: Fn(usize) -> Option<String> + Send + Sync + 'static,
{
    let peers = Arc::new(Mutex::new(Vec::new()));
    let dials = AtomicUsize::new(0);
    let sink = peers.clone();

    let dialer = MockDialer::from_fn(move |addr| {
        let n = dials.fetch_add(1, Ordering::SeqCst);
        match principals(n) {
            Some(principal) => {
                let (conn, peer) = pair(vec![principal]);
                sink.lock().unwrap().push(peer);
                Ok(conn)
            }
            None => Err(TransportError::ConnectionError(format!(
                "connection refused: {}",
                addr
            ))),
        }
    });

    (Arc::new(dialer), peers)
}

fn config() -> AgentPoolConfig {
    let mut config = AgentPoolConfig::new("proxy.test:3024", "test-cluster");
    config.keep_alive = Duration::from_secs(1);
    config.reconnect = ReconnectConfig {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        multiplier: 2.0,
        max_attempts: None,
    };
    config
}

fn pool(config: AgentPoolConfig, dialer: Arc<MockDialer>) -> AgentPool {
    init_tracing();
    AgentPool::new(
        config,
        dialer,
        Arc::new(MockTransportBuilder::new()),
        Arc::new(StaticVersion::new("1.0.0")),
    )
    .unwrap()
}

/// Wait until `count` agents reported `state`
async fn wait_for_state(
    events: &mut mpsc::UnboundedReceiver<AgentEvent>,
    state: AgentState,
    count: usize,
) -> Vec<String> {
    let mut ids = Vec::new();
    while ids.len() < count {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for agent event")
            .expect("event stream closed");
        if event.state == state {
            ids.push(event.agent_id);
        }
    }
    ids
}

#[tokio::test]
async fn test_pool_connects_agent() {
    let (dialer, peers) = proxy_dialer(|_| Some("proxy-1".to_string()));
    let pool = pool(config(), dialer.clone());
    let mut events = pool.subscribe();

    pool.start();
    pool.start();

    wait_for_state(&mut events, AgentState::Connected, 1).await;

    assert_eq!(pool.count(), 1);
    assert_eq!(pool.count_in_state(AgentState::Connected), 1);
    assert!(pool.tracker().is_claimed("proxy-1"));
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(peers.lock().unwrap().len(), 1);

    pool.stop().await;
    timeout(WAIT, pool.wait()).await.unwrap();
}

#[tokio::test]
async fn test_pool_redials_after_agent_closes() {
    let (dialer, peers) = proxy_dialer(|_| Some("proxy-1".to_string()));
    let pool = pool(config(), dialer.clone());
    let mut events = pool.subscribe();
    pool.start();

    let first = wait_for_state(&mut events, AgentState::Connected, 1).await;

    peers.lock().unwrap()[0].hang_up();

    let closed = wait_for_state(&mut events, AgentState::Closed, 1).await;
    assert_eq!(closed, first);

    let second = wait_for_state(&mut events, AgentState::Connected, 1).await;
    assert_ne!(second, first);
    assert_eq!(dialer.dial_count(), 2);
    assert_eq!(pool.count(), 1);
    assert!(pool.tracker().is_claimed("proxy-1"));

    pool.stop().await;
    timeout(WAIT, pool.wait()).await.unwrap();
}

#[tokio::test]
async fn test_pool_backs_off_until_dial_succeeds() {
    let (dialer, _peers) = proxy_dialer(|n| (n >= 2).then(|| "proxy-1".to_string()));
    let pool = pool(config(), dialer.clone());
    let mut events = pool.subscribe();
    pool.start();

    wait_for_state(&mut events, AgentState::Connected, 1).await;
    assert_eq!(dialer.dial_count(), 3);
    assert_eq!(pool.count(), 1);

    pool.stop().await;
    timeout(WAIT, pool.wait()).await.unwrap();
}

#[tokio::test]
async fn test_pool_gives_up_after_max_attempts() {
    let (dialer, _peers) = proxy_dialer(|_| None);
    let mut config = config();
    config.reconnect.max_attempts = Some(2);
    let pool = pool(config, dialer.clone());
    let mut events = pool.subscribe();
    pool.start();

    wait_for_state(&mut events, AgentState::Closed, 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(dialer.dial_count(), 3);
    assert_eq!(pool.count(), 0);

    pool.stop().await;
    timeout(WAIT, pool.wait()).await.unwrap();
}

#[tokio::test]
async fn test_pool_runs_one_agent_per_proxy() {
    let (dialer, _peers) = proxy_dialer(|n| Some(format!("proxy-{}", n + 1)));
    let mut config = config();
    config.connection_count = Some(2);
    let pool = pool(config, dialer);
    let mut events = pool.subscribe();
    pool.start();

    wait_for_state(&mut events, AgentState::Connected, 2).await;

    assert_eq!(pool.count_in_state(AgentState::Connected), 2);
    assert!(pool.tracker().is_claimed("proxy-1"));
    assert!(pool.tracker().is_claimed("proxy-2"));

    pool.stop().await;
    timeout(WAIT, pool.wait()).await.unwrap();
}

#[tokio::test]
async fn test_pool_never_doubles_up_on_a_proxy() {
    // Every dial lands on the same proxy, so the second lease cannot be used.
    let (dialer, _peers) = proxy_dialer(|_| Some("proxy-1".to_string()));
    let mut config = config();
    config.connection_count = Some(2);
    let pool = pool(config, dialer.clone());
    let mut events = pool.subscribe();
    pool.start();

    wait_for_state(&mut events, AgentState::Connected, 1).await;
    wait_for_state(&mut events, AgentState::Closed, 2).await;

    assert_eq!(pool.count_in_state(AgentState::Connected), 1);
    assert!(dialer.dial_count() >= 3);

    pool.stop().await;
    timeout(WAIT, pool.wait()).await.unwrap();
}

#[tokio::test]
async fn test_pool_stop_releases_everything() {
    let (dialer, peers) = proxy_dialer(|_| Some("proxy-1".to_string()));
    let pool = pool(config(), dialer.clone());
    let mut events = pool.subscribe();
    pool.start();

    let connected = wait_for_state(&mut events, AgentState::Connected, 1).await;

    pool.stop().await;
    let closed = wait_for_state(&mut events, AgentState::Closed, 1).await;
    assert_eq!(closed, connected);

    timeout(WAIT, pool.wait()).await.unwrap();

    assert_eq!(pool.count(), 0);
    assert_eq!(pool.tracker().outstanding(), 0);
    assert!(!pool.tracker().is_claimed("proxy-1"));
    assert!(peers.lock().unwrap()[0].conn.close_calls() >= 1);
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn test_pool_rejects_invalid_config() {
    let (dialer, _peers) = proxy_dialer(|_| None);
    let result = AgentPool::new(
        AgentPoolConfig::new("missing-port", "test-cluster"),
        dialer,
        Arc::new(MockTransportBuilder::new()),
        Arc::new(StaticVersion::new("1.0.0")),
    );
    assert!(result.is_err());
}
