//! Per-user fan-out of updates to live client mailboxes.
//!
//! Each subscribed `(user, client)` pair owns a mailbox: a bounded channel
//! with room for a single pending update plus a close signal. A sender
//! waits while the mailbox is full, so a stalled client cannot grow server
//! memory; closing the mailbox releases any sender still waiting on it.

use crate::sync::models::Update;
use crate::{Result, SyncError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pending updates a mailbox holds before senders have to wait.
pub const MAILBOX_CAPACITY: usize = 1;

/// Sending side of one client's mailbox.
#[derive(Clone)]
struct Mailbox {
    tx: mpsc::Sender<Update>,
    closed: CancellationToken,
}

impl Mailbox {
    /// Deliver one update, waiting for room. `false` once the mailbox is
    /// closed or its receiver is gone.
    async fn deliver(&self, update: Update) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            sent = self.tx.send(update) => sent.is_ok(),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Receive-only handle of a subscription.
///
/// Yields catch-up and live updates alike, and ends once the subscription
/// is closed.
pub struct UpdateReceiver {
    rx: mpsc::Receiver<Update>,
}

impl UpdateReceiver {
    /// Next update, or `None` after the mailbox was closed.
    pub async fn recv(&mut self) -> Option<Update> {
        self.rx.recv().await
    }

    /// Adapt into a stream of updates.
    pub fn into_stream(self) -> ReceiverStream<Update> {
        ReceiverStream::new(self.rx)
    }
}

/// Live mailboxes of one user's clients.
#[derive(Default)]
struct UserUpdater {
    clients: Mutex<HashMap<Uuid, Mailbox>>,
}

impl UserUpdater {
    fn mailboxes_except(&self, origin: Uuid) -> Vec<(Uuid, Mailbox)> {
        self.clients
            .lock()
            .iter()
            .filter(|(client_id, _)| **client_id != origin)
            .map(|(client_id, mailbox)| (*client_id, mailbox.clone()))
            .collect()
    }

    fn mailbox(&self, client_id: Uuid) -> Option<Mailbox> {
        self.clients.lock().get(&client_id).cloned()
    }
}

/// Routes updates between the live clients of each user.
///
/// Users never see each other's updates. Locks are only held for map
/// lookups, never while waiting on a mailbox.
#[derive(Default)]
pub struct UpdateManager {
    users: RwLock<HashMap<Uuid, Arc<UserUpdater>>>,
}

impl UpdateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client_id` of `user_id` and hand out its mailbox receiver.
    pub fn subscribe(&self, user_id: Uuid, client_id: Uuid) -> Result<UpdateReceiver> {
        let mut users = self.users.write();
        let updater = users.entry(user_id).or_default();
        let mut clients = updater.clients.lock();

        if clients.contains_key(&client_id) {
            return Err(SyncError::AlreadySubscribed { user_id, client_id });
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        clients.insert(
            client_id,
            Mailbox {
                tx,
                closed: CancellationToken::new(),
            },
        );

        tracing::debug!(%user_id, %client_id, "Client subscribed");
        Ok(UpdateReceiver { rx })
    }

    /// Close the client's mailbox and forget it.
    pub fn unsubscribe(&self, user_id: Uuid, client_id: Uuid) -> Result<()> {
        let mut users = self.users.write();
        let updater = users
            .get(&user_id)
            .ok_or_else(|| SyncError::NotFound(format!("no live clients for user {user_id}")))?;

        let (mailbox, now_empty) = {
            let mut clients = updater.clients.lock();
            let mailbox = clients.remove(&client_id).ok_or_else(|| {
                SyncError::NotFound(format!("client {client_id} is not subscribed"))
            })?;
            (mailbox, clients.is_empty())
        };
        mailbox.close();

        if now_empty {
            users.remove(&user_id);
        }

        tracing::debug!(%user_id, %client_id, "Client unsubscribed");
        Ok(())
    }

    /// Deliver `update` to every live client of `user_id` except `origin`.
    ///
    /// Returns how many mailboxes accepted it. A client that goes away
    /// mid-broadcast is skipped.
    pub async fn send_to_others(&self, user_id: Uuid, origin: Uuid, update: &Update) -> Result<usize> {
        let updater = self.updater(user_id)?;

        let mut delivered = 0;
        for (client_id, mailbox) in updater.mailboxes_except(origin) {
            if mailbox.deliver(update.clone()).await {
                delivered += 1;
            } else {
                tracing::debug!(%user_id, %client_id, "Skipping closed mailbox");
            }
        }

        Ok(delivered)
    }

    /// Deliver `update` to exactly one client.
    pub async fn send_to(&self, user_id: Uuid, client_id: Uuid, update: Update) -> Result<()> {
        let mailbox = self
            .updater(user_id)?
            .mailbox(client_id)
            .ok_or_else(|| SyncError::NotFound(format!("client {client_id} is not subscribed")))?;

        if mailbox.deliver(update).await {
            Ok(())
        } else {
            Err(SyncError::NotFound(format!(
                "mailbox of client {client_id} was closed"
            )))
        }
    }

    pub fn is_subscribed(&self, user_id: Uuid, client_id: Uuid) -> bool {
        self.users
            .read()
            .get(&user_id)
            .is_some_and(|updater| updater.clients.lock().contains_key(&client_id))
    }

    /// Number of live clients of `user_id`.
    pub fn client_count(&self, user_id: Uuid) -> usize {
        self.users
            .read()
            .get(&user_id)
            .map_or(0, |updater| updater.clients.lock().len())
    }

    fn updater(&self, user_id: Uuid) -> Result<Arc<UserUpdater>> {
        self.users
            .read()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("no live clients for user {user_id}")))
    }
}
