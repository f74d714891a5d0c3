//! Bounded fan-out of outbound messages to connected viewers.
//!
//! Each viewer gets its own queue. A message is rendered once and shared by
//! every queue. When a viewer falls too far behind, new messages for it are
//! dropped and counted; nobody else waits on it.

use crate::protocol::Outbound;

use log::{debug, warn};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex, MutexGuard,
    },
};

/// Identifies one connected viewer.
pub type ViewerId = u64;

struct Viewer {
    tx: SyncSender<Arc<str>>,
    dropped: u64,
}

/// Queues outbound messages for every subscribed viewer.
pub struct Publisher {
    capacity: usize,
    next_id: AtomicU64,
    viewers: Mutex<HashMap<ViewerId, Viewer>>,
}

impl Publisher {
    /// A publisher whose per-viewer queues hold `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Publisher {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            viewers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ViewerId, Viewer>> {
        self.viewers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a viewer. Its messages arrive on the returned receiver.
    pub fn subscribe(&self) -> (ViewerId, Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        self.lock().insert(id, Viewer { tx, dropped: 0 });
        debug!("viewer {} subscribed", id);
        (id, rx)
    }

    /// Remove a viewer. Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: ViewerId) -> bool {
        let removed = self.lock().remove(&id);
        if let Some(viewer) = &removed {
            debug!(
                "viewer {} unsubscribed ({} messages dropped)",
                id, viewer.dropped
            );
        }
        removed.is_some()
    }

    #[allow(missing_docs)]
    pub fn viewer_count(&self) -> usize {
        self.lock().len()
    }

    /// Messages dropped for `id` because its queue was full.
    pub fn dropped(&self, id: ViewerId) -> Option<u64> {
        self.lock().get(&id).map(|v| v.dropped)
    }

    /// Queue `message` for every viewer. Returns how many accepted it.
    pub fn publish(&self, message: &Outbound) -> usize {
        self.publish_text(Arc::from(message.to_json(None)))
    }

    /// Queue an already rendered message for every viewer.
    pub fn publish_text(&self, text: Arc<str>) -> usize {
        let mut viewers = self.lock();
        let mut gone = Vec::new();
        let mut accepted = 0;
        for (id, viewer) in viewers.iter_mut() {
            match offer(*id, viewer, Arc::clone(&text)) {
                Some(true) => accepted += 1,
                Some(false) => {}
                None => gone.push(*id),
            }
        }
        for id in gone {
            debug!("viewer {} went away", id);
            viewers.remove(&id);
        }
        accepted
    }

    /// Queue a reply for one viewer. Returns whether it was accepted.
    pub fn send_to(&self, id: ViewerId, text: impl Into<Arc<str>>) -> bool {
        let mut viewers = self.lock();
        let Some(viewer) = viewers.get_mut(&id) else {
            return false;
        };
        match offer(id, viewer, text.into()) {
            Some(accepted) => accepted,
            None => {
                viewers.remove(&id);
                false
            }
        }
    }
}

/// `Some(accepted)` while the viewer is connected, `None` once it is gone.
fn offer(id: ViewerId, viewer: &mut Viewer, text: Arc<str>) -> Option<bool> {
    match viewer.tx.try_send(text) {
        Ok(()) => Some(true),
        Err(TrySendError::Full(_)) => {
            viewer.dropped += 1;
            warn!(
                "viewer {} is not keeping up, dropped message ({} so far)",
                id, viewer.dropped
            );
            Some(false)
        }
        Err(TrySendError::Disconnected(_)) => None,
    }
}
