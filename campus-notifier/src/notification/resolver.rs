//! Recipient resolution.

use std::sync::Arc;

use tracing::debug;

use super::events::{ChangeRecord, EntityKey, RenderFields};
use crate::Result;
use crate::database::models::Recipient;
use crate::database::repositories::RecipientRepository;

/// Maps a change to the active, bound recipients it concerns.
///
/// Read-only: resolution never changes recipient state, and an empty result
/// is not an error.
pub struct RecipientResolver {
    repo: Arc<dyn RecipientRepository>,
}

impl RecipientResolver {
    pub fn new(repo: Arc<dyn RecipientRepository>) -> Self {
        Self { repo }
    }

    pub async fn resolve(&self, record: &ChangeRecord) -> Result<Vec<Recipient>> {
        let recipients = match (&record.key, &record.fields) {
            (
                EntityKey::News(_),
                RenderFields::News {
                    for_all_groups: true,
                    ..
                },
            ) => self.repo.list_active().await,
            (EntityKey::News(id), _) => self.repo.list_active_for_news(*id).await,
            (EntityKey::Test(_), RenderFields::Test { group_id, .. }) => {
                self.repo.list_active_in_group(*group_id).await
            }
            (EntityKey::Debt { student_id, .. }, _) => self
                .repo
                .find_active_for_student(*student_id)
                .await
                .map(|r| r.into_iter().collect()),
            (EntityKey::Test(_), _) => Ok(Vec::new()),
        }
        .map_err(|e| e.in_operation("resolve recipients"))?;

        debug!(
            entity = %record.key,
            kind = %record.kind,
            recipients = recipients.len(),
            "Resolved recipients"
        );
        Ok(recipients)
    }

    /// Every active recipient. Used for file change notifications.
    pub async fn broadcast(&self) -> Result<Vec<Recipient>> {
        self.repo
            .list_active()
            .await
            .map_err(|e| e.in_operation("resolve broadcast recipients"))
    }
}
