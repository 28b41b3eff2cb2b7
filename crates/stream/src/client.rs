// SPDX-License-Identifier: Apache-2.0

//! The stream-client contract and the three-phase handshake helpers.

use crate::error::Error;
use crate::payload::{Payload, ReplyPattern, RequestId};
use std::time::Duration;

/// Interval between reply polls while a coroutine waits for a response. Every
/// wait through [`awaitable_response`] is a suspension point of the master's
/// cooperative scheduler.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A reliable, named-handler request/reply channel to the worker fleet.
///
/// Both operations are non-blocking: `post` enqueues, `poll` returns
/// [`Error::NoMessage`] when nothing matching is ready. Network transports
/// may use background threads internally; the master only ever observes the
/// non-blocking surface.
pub trait RequestClient {
    /// Enqueues `payload` towards its handler and returns its request id.
    fn post(&self, payload: Payload) -> Result<RequestId, Error>;

    /// Returns the next reply matching `pattern` (any reply when `None`), or
    /// [`Error::NoMessage`] if nothing is ready.
    fn poll(&self, pattern: Option<&ReplyPattern>) -> Result<Payload, Error>;
}

/// Polls until a reply matching `pattern` arrives, sleeping [`POLL_INTERVAL`]
/// between attempts.
pub async fn awaitable_response<C: RequestClient>(
    client: &C,
    pattern: &ReplyPattern,
) -> Result<Payload, Error> {
    loop {
        match client.poll(Some(pattern)) {
            Ok(payload) => return Ok(payload),
            Err(Error::NoMessage) => tokio::time::sleep(POLL_INTERVAL).await,
            Err(e) => return Err(e),
        }
    }
}

/// Posts a group of requests with the ordering handshake.
///
/// All payloads are posted first; then every worker's SYN is awaited; then
/// ACKs are posted in the original post order. Workers begin executing in ACK
/// order, so any set of workers co-addressed by several concurrent groups
/// executes them in an identical order.
pub async fn request_all<C: RequestClient>(
    client: &C,
    payloads: Vec<Payload>,
) -> Result<Vec<RequestId>, Error> {
    let started = tokio::time::Instant::now();
    let n = payloads.len();
    let mut request_ids = Vec::with_capacity(n);
    let mut syn_ids = Vec::with_capacity(n);
    let mut acks = Vec::with_capacity(n);
    for payload in payloads {
        syn_ids.push(payload.syn_reply_id);
        acks.push(payload.ack());
        request_ids.push(client.post(payload)?);
    }
    for syn_id in syn_ids {
        let _ = awaitable_response(client, &ReplyPattern::exact([syn_id])).await?;
    }
    for ack in acks {
        let _ = client.post(ack)?;
    }
    tracing::trace!(
        requests = n,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "handshake complete"
    );
    Ok(request_ids)
}

/// Awaits the final replies for `request_ids`, returned in the same order.
pub async fn gather_replies<C: RequestClient>(
    client: &C,
    request_ids: &[RequestId],
) -> Result<Vec<Payload>, Error> {
    let patterns: Vec<ReplyPattern> = request_ids
        .iter()
        .map(|&id| ReplyPattern::exact([id]))
        .collect();
    let waits = patterns
        .iter()
        .map(|pattern| awaitable_response(client, pattern));
    futures::future::join_all(waits)
        .await
        .into_iter()
        .collect()
}

/// Posts a request group and awaits every final reply.
pub async fn round_trip<C: RequestClient>(
    client: &C,
    payloads: Vec<Payload>,
) -> Result<Vec<Payload>, Error> {
    let request_ids = request_all(client, payloads).await?;
    gather_replies(client, &request_ids).await
}
