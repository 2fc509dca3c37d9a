//! Deadline- and cancel-aware channel operations.
//!
//! Every inter-stage transfer in the pipeline is the first ready of
//! (send/recv success, cancel broadcast, deadline elapsed). Workers call
//! these helpers instead of touching the channels directly so the race is
//! applied uniformly.

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::signal::CancelSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Receiver dropped; the stream is over.
    Closed,
    Cancelled,
    Expired,
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

#[derive(Debug)]
pub enum RecvOutcome<T> {
    Item(T),
    /// Sender side closed; normal stream terminator.
    Closed,
    Cancelled,
    Expired,
}

/// Bounded send racing cancel and deadline.
pub async fn send_guarded<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancelSignal,
    deadline: Instant,
) -> SendOutcome {
    tokio::select! {
        res = tx.send(item) => match res {
            Ok(()) => SendOutcome::Sent,
            Err(_) => SendOutcome::Closed,
        },
        _ = cancel.cancelled() => SendOutcome::Cancelled,
        _ = sleep_until(deadline) => SendOutcome::Expired,
    }
}

/// Bounded receive racing cancel and deadline. Channel closure is the normal
/// terminator, not an error.
pub async fn recv_guarded<T>(
    rx: &mut mpsc::Receiver<T>,
    cancel: &CancelSignal,
    deadline: Instant,
) -> RecvOutcome<T> {
    tokio::select! {
        item = rx.recv() => match item {
            Some(i) => RecvOutcome::Item(i),
            None => RecvOutcome::Closed,
        },
        _ = cancel.cancelled() => RecvOutcome::Cancelled,
        _ = sleep_until(deadline) => RecvOutcome::Expired,
    }
}
