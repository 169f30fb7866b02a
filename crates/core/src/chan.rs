//! Queue helpers shared by every stage: each blocking operation races the
//! pipeline's cancellation token.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Send `value`, giving up when `cancel` fires or the receiver is gone.
/// Returns `false` when the caller should stop producing.
pub async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, value: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        res = tx.send(value) => res.is_ok(),
    }
}

/// Receive the next value; `None` on cancellation or when all senders are gone.
pub async fn recv_or_cancel<T>(rx: &mut mpsc::Receiver<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        v = rx.recv() => v,
    }
}
