//! Caller authorization for administrative operations.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Decides whether `account_id` may administer documents of `project_id`.
#[async_trait]
pub trait AccessCheck: Send + Sync {
    async fn check(&self, account_id: Uuid, project_id: Uuid) -> Result<()>;
}

/// Lets everyone through. For single-user local setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessCheck for AllowAll {
    async fn check(&self, _account_id: Uuid, _project_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Project collaborator lists.
#[derive(Debug, Default)]
pub struct Collaborators {
    members: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, project_id: Uuid, account_id: Uuid) {
        self.members
            .write()
            .entry(project_id)
            .or_default()
            .insert(account_id);
    }

    pub fn revoke(&self, project_id: Uuid, account_id: Uuid) {
        if let Some(accounts) = self.members.write().get_mut(&project_id) {
            accounts.remove(&account_id);
        }
    }
}

#[async_trait]
impl AccessCheck for Collaborators {
    async fn check(&self, account_id: Uuid, project_id: Uuid) -> Result<()> {
        let allowed = self
            .members
            .read()
            .get(&project_id)
            .map_or(false, |accounts| accounts.contains(&account_id));
        if allowed {
            Ok(())
        } else {
            Err(SyncError::Unauthorized(format!(
                "account {} is not a collaborator on project {}",
                account_id, project_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collaborators_gate_by_project() {
        let access = Collaborators::new();
        let (project, account) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(access.check(account, project).await.is_err());
        access.grant(project, account);
        assert!(access.check(account, project).await.is_ok());
        assert!(access.check(account, Uuid::new_v4()).await.is_err());
        access.revoke(project, account);
        assert!(matches!(
            access.check(account, project).await,
            Err(SyncError::Unauthorized(_))
        ));
    }
}
