//! Heartbeat channel duty

use crate::agent::AgentInner;
use crate::{AgentError, HEARTBEAT_CHANNEL, PING_REQUEST};
use bytes::Bytes;
use localup_transport::{Channel, Request, RequestStream, SecureConnection};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Open the heartbeat channel and send the first ping right away
pub(crate) async fn open(
    conn: &Arc<dyn SecureConnection>,
) -> Result<(Box<dyn Channel>, RequestStream), AgentError> {
    let (mut channel, requests) = conn
        .open_channel(HEARTBEAT_CHANNEL, Bytes::new())
        .await
        .map_err(AgentError::ChannelOpen)?;

    if let Err(e) = channel
        .send_request(PING_REQUEST, false, Bytes::new())
        .await
    {
        let _ = channel.close().await;
        return Err(AgentError::ChannelOpen(e));
    }

    Ok((channel, requests))
}

/// Ping every keep-alive interval until cancelled or a ping fails
pub(crate) async fn run(
    agent: Arc<AgentInner>,
    mut channel: Box<dyn Channel>,
    requests: RequestStream,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(agent.keep_alive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and `open` already pinged.
    ticker.tick().await;

    let mut requests = Some(requests);

    let failure = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            request = next_request(&mut requests) => match request {
                Some(request) => {
                    debug!(agent_id = %agent.id, kind = %request.kind, "Discarding heartbeat channel request");
                    let _ = request.reply(false, Bytes::new());
                }
                None => requests = None,
            },
            _ = ticker.tick() => {
                if let Err(e) = channel.send_request(PING_REQUEST, false, Bytes::new()).await {
                    break Some(AgentError::Liveness(e));
                }
                debug!(agent_id = %agent.id, "Sent ping");
            }
        }
    };

    if let Err(e) = channel.close().await {
        debug!(agent_id = %agent.id, error = %e, "Heartbeat channel already closed");
    }

    match failure {
        Some(e) => {
            warn!(agent_id = %agent.id, proxy = %agent.addr, error = %e, "Proxy stopped answering");
            agent.teardown("heartbeat failed").await;
        }
        None => agent.teardown("cancelled").await,
    }
}

/// Next request on the channel; pending forever once the stream has ended
async fn next_request(requests: &mut Option<RequestStream>) -> Option<Request> {
    match requests {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
