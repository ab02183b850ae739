//! Duties serving what the proxy sends over the connection

use crate::agent::AgentInner;
use crate::{UnknownRequestPolicy, TRANSPORT_CHANNEL, VERSION_REQUEST};
use bytes::Bytes;
use localup_transport::{NewChannel, NewChannelStream, Request, RequestStream, SecureConnection};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Answer global requests until cancelled or the stream ends
///
/// The end of the stream means the connection is gone, which closes the agent.
pub(crate) async fn serve_global_requests(
    agent: Arc<AgentInner>,
    mut requests: RequestStream,
    cancel: CancellationToken,
) {
    let reason = loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break "cancelled",
            request = requests.recv() => request,
        };

        let Some(request) = request else {
            info!(agent_id = %agent.id, proxy = %agent.addr, "Proxy closed the connection");
            break "connection closed";
        };

        handle_global_request(&agent, request).await;
    };

    agent.teardown(reason).await;
}

async fn handle_global_request(agent: &AgentInner, request: Request) {
    if request.kind == VERSION_REQUEST {
        let (ok, payload) = match agent.version.resolve().await {
            Ok(version) => (true, Bytes::from(version)),
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "Cannot answer version request");
                (false, Bytes::new())
            }
        };
        if let Err(e) = request.reply(ok, payload) {
            debug!(agent_id = %agent.id, error = %e, "Failed to reply to version request");
        }
        return;
    }

    debug!(
        agent_id = %agent.id,
        kind = %request.kind,
        want_reply = request.want_reply,
        "Unknown global request"
    );

    match agent.unknown_requests {
        UnknownRequestPolicy::Reject => {
            let _ = request.reply(false, Bytes::new());
        }
        UnknownRequestPolicy::Ignore => {}
    }
}

/// Accept transport channels opened by the proxy and hand them to transports
pub(crate) async fn serve_channels(
    agent: Arc<AgentInner>,
    mut channels: NewChannelStream,
    conn: Arc<dyn SecureConnection>,
    cancel: CancellationToken,
) {
    loop {
        let channel = tokio::select! {
            _ = cancel.cancelled() => break,
            channel = channels.recv() => channel,
        };
        let Some(channel) = channel else {
            debug!(agent_id = %agent.id, "Channel stream ended");
            break;
        };

        handle_channel(&agent, channel, &conn, &cancel).await;
    }
}

async fn handle_channel(
    agent: &AgentInner,
    channel: Box<dyn NewChannel>,
    conn: &Arc<dyn SecureConnection>,
    cancel: &CancellationToken,
) {
    let kind = channel.channel_type().to_string();

    if kind != TRANSPORT_CHANNEL {
        debug!(agent_id = %agent.id, kind = %kind, "Rejecting channel");
        if let Err(e) = channel
            .reject(&format!("unknown channel type: {}", kind))
            .await
        {
            debug!(agent_id = %agent.id, error = %e, "Failed to reject channel");
        }
        return;
    }

    match channel.accept().await {
        Ok((channel, requests)) => {
            let transport =
                agent
                    .transporter
                    .build(cancel.child_token(), channel, requests, conn.clone());
            agent.tasks.spawn(transport.serve());
            debug!(agent_id = %agent.id, "Accepted transport channel");
        }
        Err(e) => {
            warn!(agent_id = %agent.id, error = %e, "Failed to accept transport channel");
        }
    }
}
