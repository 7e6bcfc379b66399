use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Producer side of the new-message notification queue
///
/// Notifying never blocks: when the queue is full the notification is
/// dropped, since the sequencer is already due to read past it.
#[derive(Clone)]
pub struct NewMessageNotifier {
    tx: mpsc::Sender<i64>,
}

impl NewMessageNotifier {
    /// Create a notifier and the queue it feeds, holding up to `capacity`
    /// notifications
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<i64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Report that the message with `sequence` was stored
    pub fn notify(&self, sequence: i64) {
        match self.tx.try_send(sequence) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(sequence, "notification queue full, dropping notification")
            }
            Err(TrySendError::Closed(_)) => {
                trace!(sequence, "notification queue closed")
            }
        }
    }
}

/// Collapse notifications into shoulder taps for the sequencer
///
/// The tap channel holds a single pending tap; further notifications while
/// one is pending are absorbed by it.
pub async fn forward_notifications(
    mut notifications: mpsc::Receiver<i64>,
    taps: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            notification = notifications.recv() => {
                let Some(sequence) = notification else { break };
                trace!(sequence, "new message notification");
                let _ = taps.try_send(());
            }
        }
    }
    debug!("notification forwarder stopped");
}
