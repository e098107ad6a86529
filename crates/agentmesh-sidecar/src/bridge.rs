//! Bidirectional relay between two open event streams.
//!
//! A [`Bridge`] pairs the near stream (accepted by a listener) with the far
//! stream (opened by the sidecar) and runs one forwarding task per
//! direction. Each task posts exactly one outcome on a result channel with
//! room for both, so posting never blocks. The session ends when both
//! directions drained, when either failed, or when the governing token is
//! cancelled; whatever is still running is then aborted.

use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, warn};

/// Bounded wait when handing a terminal status to a slow reader.
const FAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Events read from one end of a session.
pub type EventSource<T> = BoxStream<'static, Result<T, Status>>;

/// Write half of one end of a session. Dropping it half-closes that end.
pub enum Outlet<T> {
    /// Response side of a stream this sidecar is serving; can carry a
    /// terminal status back to the caller.
    Reply(mpsc::Sender<Result<T, Status>>),
    /// Request side of a stream this sidecar opened.
    Request(mpsc::Sender<T>),
}

impl<T> Outlet<T> {
    async fn send(&self, event: T) -> Result<(), ()> {
        match self {
            Outlet::Reply(tx) => tx.send(Ok(event)).await.map_err(|_| ()),
            Outlet::Request(tx) => tx.send(event).await.map_err(|_| ()),
        }
    }

    fn reply_handle(&self) -> Option<mpsc::WeakSender<Result<T, Status>>> {
        match self {
            Outlet::Reply(tx) => Some(tx.downgrade()),
            Outlet::Request(_) => None,
        }
    }
}

/// One end of a session: where its events come from and where events for
/// it go.
pub struct Duplex<T> {
    label: &'static str,
    source: EventSource<T>,
    outlet: Outlet<T>,
}

impl<T> Duplex<T> {
    pub fn new(label: &'static str, source: EventSource<T>, outlet: Outlet<T>) -> Self {
        Self {
            label,
            source,
            outlet,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("receive from {leg} stream failed: {status}")]
    Receive { leg: &'static str, status: Status },
    #[error("send to {leg} stream failed: stream closed")]
    Send { leg: &'static str },
    #[error("session cancelled")]
    Cancelled,
    #[error("forwarding task ended without reporting")]
    Lost,
}

impl ForwardError {
    /// Status for the near caller. A receive failure relays the peer's
    /// status unchanged.
    pub fn to_status(&self) -> Status {
        match self {
            ForwardError::Receive { status, .. } => status.clone(),
            ForwardError::Send { .. } => Status::unavailable(self.to_string()),
            ForwardError::Cancelled => Status::cancelled(self.to_string()),
            ForwardError::Lost => Status::internal(self.to_string()),
        }
    }
}

/// Event counts of a session that completed cleanly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSummary {
    /// Events relayed near → far.
    pub upstream: u64,
    /// Events relayed far → near.
    pub downstream: u64,
}

#[derive(Debug, Clone, Copy)]
enum Lane {
    Upstream,
    Downstream,
}

enum Outcome<T> {
    Drained { lane: Lane, forwarded: u64 },
    Failed { error: ForwardError, outlet: Outlet<T> },
}

pub struct Bridge<T> {
    near: Duplex<T>,
    far: Duplex<T>,
}

impl<T: Send + 'static> Bridge<T> {
    pub fn new(near: Duplex<T>, far: Duplex<T>) -> Self {
        Self { near, far }
    }

    /// Relay until both directions drain, either fails, or `cancel` fires.
    pub async fn run(self, cancel: &CancellationToken) -> Result<BridgeSummary, ForwardError> {
        let Bridge { near, far } = self;
        let reply_handles: Vec<_> = [near.outlet.reply_handle(), far.outlet.reply_handle()]
            .into_iter()
            .flatten()
            .collect();

        let (results_tx, mut results_rx) = mpsc::channel(2);
        let mut tasks = JoinSet::new();
        tasks.spawn(forward(
            Lane::Upstream,
            near.label,
            near.source,
            far.label,
            far.outlet,
            results_tx.clone(),
        ));
        tasks.spawn(forward(
            Lane::Downstream,
            far.label,
            far.source,
            near.label,
            near.outlet,
            results_tx,
        ));

        let mut summary = BridgeSummary::default();
        let mut drained = 0;
        let (error, returned) = loop {
            tokio::select! {
                _ = cancel.cancelled() => break (ForwardError::Cancelled, None),
                outcome = results_rx.recv() => match outcome {
                    Some(Outcome::Drained { lane, forwarded }) => {
                        match lane {
                            Lane::Upstream => summary.upstream = forwarded,
                            Lane::Downstream => summary.downstream = forwarded,
                        }
                        drained += 1;
                        if drained == 2 {
                            return Ok(summary);
                        }
                    }
                    Some(Outcome::Failed { error, outlet }) => break (error, Some(outlet)),
                    None => break (ForwardError::Lost, None),
                },
            }
        };

        // Hold the reply channels open across the abort so the terminal
        // status can still be delivered.
        let mut replies: Vec<mpsc::Sender<Result<T, Status>>> =
            reply_handles.iter().filter_map(|h| h.upgrade()).collect();
        if let Some(Outlet::Reply(tx)) = returned {
            if !replies.iter().any(|r| r.same_channel(&tx)) {
                replies.push(tx);
            }
        }
        tasks.shutdown().await;

        let status = error.to_status();
        for reply in replies {
            match tokio::time::timeout(FAULT_DELIVERY_TIMEOUT, reply.send(Err(status.clone()))).await
            {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!("caller already gone; terminal status dropped"),
                Err(_) => warn!(code = ?status.code(), "timed out delivering terminal status"),
            }
        }
        Err(error)
    }
}

async fn forward<T>(
    lane: Lane,
    from: &'static str,
    mut source: EventSource<T>,
    to: &'static str,
    outlet: Outlet<T>,
    results: mpsc::Sender<Outcome<T>>,
) {
    let mut forwarded = 0u64;
    let failure = loop {
        match source.next().await {
            None => break None,
            Some(Ok(event)) => {
                if outlet.send(event).await.is_err() {
                    match &outlet {
                        // The opened call stopped reading: it has finished or
                        // been reset, and its own status arrives on the other
                        // lane.
                        Outlet::Request(_) => {
                            debug!(from, to, forwarded, "peer stopped reading; lane closed");
                            break None;
                        }
                        Outlet::Reply(_) => break Some(ForwardError::Send { leg: to }),
                    }
                }
                forwarded += 1;
            }
            Some(Err(status)) => break Some(ForwardError::Receive { leg: from, status }),
        }
    };

    let outcome = match failure {
        None => {
            // Half-close the destination before reporting.
            drop(outlet);
            debug!(from, to, forwarded, "lane drained");
            Outcome::Drained { lane, forwarded }
        }
        Some(error) => Outcome::Failed { error, outlet },
    };
    let _ = results.try_send(outcome);
}
