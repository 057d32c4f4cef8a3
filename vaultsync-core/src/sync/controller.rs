//! Secrets controller: durable writes, live fan-out and subscriptions.

use crate::store::SecretStore;
use crate::sync::models::{Secret, Update, UpdateAction};
use crate::sync::reconcile::{CatchUp, CatchUpDeletionRouting};
use crate::sync::update_manager::{UpdateManager, UpdateReceiver};
use crate::sync::version::Version;
use crate::{Result, SyncError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MakeUpdateOutcome {
    pub version: Version,
    /// Assigned id; only set for creates.
    pub new_id: Option<Uuid>,
}

struct Session {
    id: u64,
    token: CancellationToken,
}

/// Live subscriptions, keyed by `(user, client)`.
///
/// A session id tells a stale cleanup apart from the current subscription
/// of the same pair.
struct Sessions {
    updates: Arc<UpdateManager>,
    live: Mutex<HashMap<(Uuid, Uuid), Session>>,
    next_id: AtomicU64,
}

impl Sessions {
    fn open(
        &self,
        user_id: Uuid,
        client_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(u64, CancellationToken, UpdateReceiver)> {
        let mut live = self.live.lock();
        let receiver = self.updates.subscribe(user_id, client_id)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = cancel.child_token();
        live.insert(
            (user_id, client_id),
            Session {
                id,
                token: token.clone(),
            },
        );

        Ok((id, token, receiver))
    }

    /// Unsubscribe the pair. With `only` set, a newer session is left alone.
    fn close(&self, user_id: Uuid, client_id: Uuid, only: Option<u64>) -> bool {
        let mut live = self.live.lock();
        let key = (user_id, client_id);
        match live.get(&key) {
            Some(session) if only.map_or(true, |id| id == session.id) => {}
            _ => return false,
        }

        if let Some(session) = live.remove(&key) {
            session.token.cancel();
        }
        if let Err(e) = self.updates.unsubscribe(user_id, client_id) {
            tracing::warn!(%user_id, %client_id, "Failed to unsubscribe: {}", e);
        }
        true
    }
}

/// Coordinates the secret store with the live update registry.
pub struct SecretsController {
    store: Arc<dyn SecretStore>,
    updates: Arc<UpdateManager>,
    sessions: Arc<Sessions>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    routing: CatchUpDeletionRouting,
}

impl SecretsController {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        let updates = Arc::new(UpdateManager::new());
        Self {
            store,
            sessions: Arc::new(Sessions {
                updates: updates.clone(),
                live: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            updates,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            routing: CatchUpDeletionRouting::default(),
        }
    }

    /// Choose who hears about secrets deleted during catch-up.
    pub fn with_catch_up_routing(mut self, routing: CatchUpDeletionRouting) -> Self {
        self.routing = routing;
        self
    }

    pub fn catch_up_routing(&self) -> CatchUpDeletionRouting {
        self.routing
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    /// Apply a client write and fan it out to the owner's other clients.
    ///
    /// Fails with [`SyncError::Cancelled`] if `cancel` or the controller
    /// shutdown fires before the store has answered; nothing is broadcast
    /// then.
    pub async fn make_update(
        &self,
        update: Update,
        cancel: &CancellationToken,
    ) -> Result<MakeUpdateOutcome> {
        if self.is_cancelled(cancel) {
            return Err(SyncError::Cancelled);
        }

        let applied = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            _ = self.shutdown.cancelled() => return Err(SyncError::Cancelled),
            applied = self.apply(update) => applied?,
        };
        if self.is_cancelled(cancel) {
            return Err(SyncError::Cancelled);
        }
        let (outcome, stored) = applied;

        tracing::debug!(
            user_id = %stored.user_id,
            client_id = %stored.client_id,
            secret_id = %stored.secret.id,
            action = stored.action.as_str(),
            version = %outcome.version,
            "Secret written"
        );

        match self
            .updates
            .send_to_others(stored.user_id, stored.client_id, &stored)
            .await
        {
            Ok(delivered) => {
                tracing::debug!(user_id = %stored.user_id, delivered, "Update fanned out");
            }
            Err(SyncError::NotFound(_)) => {}
            Err(e) => {
                tracing::error!(user_id = %stored.user_id, "Failed to fan out update: {}", e);
            }
        }

        Ok(outcome)
    }

    /// Store the update; returns the outcome and the update as stored.
    async fn apply(&self, update: Update) -> Result<(MakeUpdateOutcome, Update)> {
        let Update {
            user_id,
            client_id,
            action,
            mut secret,
        } = update;

        let outcome = match action {
            UpdateAction::Create => {
                let (id, version) = self.store.add_secret(user_id, &secret).await?;
                secret.id = id;
                secret.version = Some(version);
                MakeUpdateOutcome {
                    version,
                    new_id: Some(id),
                }
            }
            UpdateAction::Update => {
                let version = self.store.update_secret(user_id, &secret).await?;
                secret.version = Some(version);
                MakeUpdateOutcome {
                    version,
                    new_id: None,
                }
            }
            UpdateAction::Delete => {
                let version = self.store.remove_secret(user_id, secret.id).await?;
                secret = Secret::id_only(secret.id);
                secret.version = Some(version);
                MakeUpdateOutcome {
                    version,
                    new_id: None,
                }
            }
        };

        Ok((outcome, Update::new(user_id, client_id, action, secret)))
    }

    /// Open a live subscription and start catching the client up.
    ///
    /// The receiver first yields the catch-up events, interleaved with live
    /// updates. Cancelling `cancel` closes the subscription.
    pub fn subscribe_updates(
        &self,
        user_id: Uuid,
        client_id: Uuid,
        known_version: Version,
        known_ids: Vec<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<UpdateReceiver> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let (session_id, session, receiver) = self.sessions.open(user_id, client_id, cancel)?;
        tracing::info!(%user_id, %client_id, %known_version, "Client subscribed to updates");

        {
            let sessions = self.sessions.clone();
            let session = session.clone();
            let shutdown = self.shutdown.clone();
            self.tasks.spawn(async move {
                tokio::select! {
                    _ = session.cancelled() => {}
                    _ = shutdown.cancelled() => {}
                }
                if sessions.close(user_id, client_id, Some(session_id)) {
                    tracing::info!(%user_id, %client_id, "Client unsubscribed from updates");
                } else {
                    tracing::debug!(%user_id, %client_id, "Subscription already closed");
                }
            });
        }

        {
            let store = self.store.clone();
            let updates = self.updates.clone();
            let shutdown = self.shutdown.clone();
            let routing = self.routing;
            self.tasks.spawn(async move {
                let catch_up = CatchUp {
                    store: store.as_ref(),
                    updates: &updates,
                    user_id,
                    client_id,
                    routing,
                };
                tokio::select! {
                    biased;
                    _ = session.cancelled() => {}
                    _ = shutdown.cancelled() => {}
                    result = catch_up.run(known_version, known_ids) => match result {
                        Ok(report) => tracing::debug!(
                            %user_id,
                            %client_id,
                            forgotten = report.forgotten,
                            vanished = report.vanished,
                            updated = report.updated,
                            created = report.created,
                            "Catch-up finished"
                        ),
                        Err(e) => tracing::warn!(
                            %user_id,
                            %client_id,
                            "Catch-up stopped early: {}",
                            e
                        ),
                    },
                }
            });
        }

        Ok(receiver)
    }

    /// Close a live subscription from the server side.
    pub fn disconnect(&self, user_id: Uuid, client_id: Uuid) -> bool {
        self.sessions.close(user_id, client_id, None)
    }

    pub fn is_subscribed(&self, user_id: Uuid, client_id: Uuid) -> bool {
        self.updates.is_subscribed(user_id, client_id)
    }

    /// Number of live subscriptions of `user_id`.
    pub fn live_clients(&self, user_id: Uuid) -> usize {
        self.updates.client_count(user_id)
    }

    /// Close every subscription and wait for background tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Secrets controller stopped");
    }

    /// Tasks still running: one watcher per live subscription plus any
    /// unfinished catch-up passes.
    #[cfg(test)]
    pub(super) fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn is_cancelled(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.shutdown.is_cancelled()
    }
}
