//! Action observers shipped with the driver.

use davdrive_core::ports::{ActionOutcome, IActionObserver, RepositoryAction};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Logs every repository action.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl IActionObserver for TracingObserver {
    fn action_performed(&self, action: RepositoryAction) {
        match &action.outcome {
            ActionOutcome::Success => info!(
                method = %action.method,
                path = %action.path,
                object_id = action.object_id,
                "Repository action succeeded"
            ),
            ActionOutcome::Failed(message) => warn!(
                method = %action.method,
                path = %action.path,
                object_id = action.object_id,
                error = %message,
                recovery_copy = ?action.local_temporary_path,
                "Repository action failed"
            ),
        }
    }

    fn authentication_failed(&self) {
        warn!("Server rejected the configured credentials");
    }
}

/// Something an observer was told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveEvent {
    Action(RepositoryAction),
    AuthenticationFailed,
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<DriveEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DriveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl IActionObserver for ChannelObserver {
    fn action_performed(&self, action: RepositoryAction) {
        // Nobody listening is fine
        let _ = self.tx.send(DriveEvent::Action(action));
    }

    fn authentication_failed(&self) {
        let _ = self.tx.send(DriveEvent::AuthenticationFailed);
    }
}
