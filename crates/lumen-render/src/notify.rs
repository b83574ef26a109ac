// SPDX-License-Identifier: CEPL-1.0
//! Display notifications marshalled onto the render thread.
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use crate::color::ColorInfo;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Notification {
    ColorInfoChanged(ColorInfo),
    DisplayTopologyChanged,
}

/// Receiving end, owned by the orchestrator. Drained on the render thread
/// only; nothing GPU-related ever runs on the sender's thread.
pub struct NotificationQueue {
    tx: Sender<Notification>,
    rx: Receiver<Notification>,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self { tx, rx }
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.tx.clone(),
            waker: None,
        }
    }

    /// Everything queued so far, oldest first.
    pub fn drain(&self) -> impl Iterator<Item = Notification> + '_ {
        self.rx.try_iter()
    }
}

type Waker = Arc<dyn Fn() + Send + Sync>;

/// Sending end, safe to move to any thread.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Notification>,
    waker: Option<Waker>,
}

impl Notifier {
    /// Runs `waker` after every send so an idle event loop gets woken.
    pub fn with_waker(mut self, waker: impl Fn() + Send + Sync + 'static) -> Self {
        self.waker = Some(Arc::new(waker));
        self
    }

    /// Returns `false` once the queue has been dropped.
    pub fn notify(&self, notification: Notification) -> bool {
        if self.tx.send(notification).is_err() {
            return false;
        }
        if let Some(wake) = &self.waker {
            wake();
        }
        true
    }
}
