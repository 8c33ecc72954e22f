// ── Chatvend Engine: Privacy Use-Case ──────────────────────────────────────
// Toggles over the embedded privacy settings. Writes go through the user
// decorator so both cache keys drop.

use log::info;
use std::sync::Arc;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::User;
use crate::engine::repos::cached::CachedUsers;

pub struct PrivacyService {
    users: Arc<CachedUsers>,
}

impl PrivacyService {
    pub fn new(users: Arc<CachedUsers>) -> Self {
        PrivacyService { users }
    }

    pub async fn toggle_storage(&self, user: &User) -> EngineResult<User> {
        let mut user = user.clone();
        user.privacy.allow_message_storage = !user.privacy.allow_message_storage;
        self.save(user).await
    }

    pub async fn toggle_encryption(&self, user: &User) -> EngineResult<User> {
        let mut user = user.clone();
        user.privacy.data_encrypted = !user.privacy.data_encrypted;
        self.save(user).await
    }

    pub async fn toggle_auto_delete(&self, user: &User) -> EngineResult<User> {
        let mut user = user.clone();
        user.privacy.auto_delete = !user.privacy.auto_delete;
        self.save(user).await
    }

    pub async fn set_retention_days(&self, user: &User, days: u32) -> EngineResult<User> {
        if days == 0 {
            return Err(EngineError::InvalidArgument("retention must be at least 1 day".into()));
        }
        let mut user = user.clone();
        user.privacy.retention_days = days;
        self.save(user).await
    }

    async fn save(&self, user: User) -> EngineResult<User> {
        self.users.update(&user).await?;
        info!(
            "[privacy] User {} settings: storage={} encrypted={} auto_delete={} retention={}d",
            user.id,
            user.privacy.allow_message_storage,
            user.privacy.data_encrypted,
            user.privacy.auto_delete,
            user.privacy.retention_days
        );
        Ok(user)
    }
}
