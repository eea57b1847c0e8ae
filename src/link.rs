//! Link State
//!
//! "Transport usable" condition. The connectivity side owns the single
//! [`LinkControl`]; everyone else observes through cloned [`LinkState`]s.

use tokio::sync::watch;

/// Setter half, held by whatever brings the network up
#[derive(Debug)]
pub struct LinkControl(watch::Sender<bool>);

/// Observer half
#[derive(Debug, Clone)]
pub struct LinkState(watch::Receiver<bool>);

/// Create a link condition, initially down
pub fn link() -> (LinkControl, LinkState) {
    let (tx, rx) = watch::channel(false);
    (LinkControl(tx), LinkState(rx))
}

impl LinkControl {
    pub fn set_up(&self) {
        self.set(true);
    }

    pub fn set_down(&self) {
        self.set(false);
    }

    fn set(&self, up: bool) {
        self.0.send_if_modified(|current| {
            if *current == up {
                return false;
            }
            *current = up;
            if up {
                tracing::info!("Link up");
            } else {
                tracing::warn!("Link down");
            }
            true
        });
    }

    /// Observer for this link
    pub fn state(&self) -> LinkState {
        LinkState(self.0.subscribe())
    }
}

impl LinkState {
    pub fn is_up(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait until the link is up. Returns `false` if the setter went away
    /// without ever raising it.
    pub async fn wait_up(&mut self) -> bool {
        self.0.wait_for(|up| *up).await.is_ok()
    }
}
