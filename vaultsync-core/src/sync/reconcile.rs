//! Catch-up of a reconnecting client from its version watermark.

use crate::store::SecretStore;
use crate::sync::models::{Secret, Update, UpdateAction};
use crate::sync::update_manager::UpdateManager;
use crate::sync::version::Version;
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who is told about secrets removed because the reconnecting client
/// never knew them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpDeletionRouting {
    /// Broadcast from the requester to the owner's other live clients.
    #[default]
    OtherClients,
    /// Sent to the reconnecting client only.
    Requester,
}

/// Outcome counts of one catch-up pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Secrets deleted because the client did not know them.
    pub forgotten: usize,
    /// Known secrets that no longer exist.
    pub vanished: usize,
    /// Known secrets changed after the watermark.
    pub updated: usize,
    /// Secrets the client has never seen.
    pub created: usize,
}

/// One reconciliation pass for a single `(user, client)` subscription.
pub(crate) struct CatchUp<'a> {
    pub store: &'a dyn SecretStore,
    pub updates: &'a UpdateManager,
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub routing: CatchUpDeletionRouting,
}

impl CatchUp<'_> {
    /// Replay what the client missed since `known_version`.
    ///
    /// Stops at the first store or delivery failure; what was sent up to
    /// that point stays sent.
    pub async fn run(&self, known_version: Version, mut known_ids: Vec<Uuid>) -> Result<CatchUpReport> {
        known_ids.sort_unstable();
        known_ids.dedup();

        let mut report = CatchUpReport::default();

        let forgotten = self
            .store
            .delete_unknown_secrets_before_version(self.user_id, known_version, &known_ids)
            .await?;
        for id in forgotten {
            self.route_forgotten(id).await?;
            report.forgotten += 1;
        }

        let mut existing = self.store.secret_ids(self.user_id).await?;
        existing.sort_unstable();
        for id in known_ids
            .iter()
            .filter(|id| existing.binary_search(id).is_err())
        {
            self.send(UpdateAction::Delete, Secret::id_only(*id)).await?;
            report.vanished += 1;
        }

        let newer = self
            .store
            .secrets_above_version(self.user_id, known_version)
            .await?;
        for secret in newer {
            if known_ids.binary_search(&secret.id).is_ok() {
                self.send(UpdateAction::Update, secret).await?;
                report.updated += 1;
            } else {
                self.send(UpdateAction::Create, secret).await?;
                report.created += 1;
            }
        }

        Ok(report)
    }

    async fn route_forgotten(&self, id: Uuid) -> Result<()> {
        match self.routing {
            CatchUpDeletionRouting::Requester => {
                self.send(UpdateAction::Delete, Secret::id_only(id)).await
            }
            CatchUpDeletionRouting::OtherClients => {
                let update = self.update(UpdateAction::Delete, Secret::id_only(id));
                match self
                    .updates
                    .send_to_others(self.user_id, self.client_id, &update)
                    .await
                {
                    Ok(_) | Err(SyncError::NotFound(_)) => {}
                    Err(e) => tracing::warn!(
                        user_id = %self.user_id,
                        secret_id = %id,
                        "Failed to broadcast catch-up deletion: {}",
                        e
                    ),
                }
                Ok(())
            }
        }
    }

    async fn send(&self, action: UpdateAction, secret: Secret) -> Result<()> {
        let update = self.update(action, secret);
        self.updates
            .send_to(self.user_id, self.client_id, update)
            .await
    }

    fn update(&self, action: UpdateAction, secret: Secret) -> Update {
        Update::new(self.user_id, self.client_id, action, secret)
    }
}
