// Identity lookup for the `identify` handshake.
//
// Resolves a user id (and role) to the display name kept by the
// patient/clinician records. The lookup fails closed: an unknown id is
// `None` and the caller rejects the identify.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use consulta_common::types::Role;
use sqlx::PgPool;
use tokio::sync::RwLock;

/// Display-name resolution backed by the platform's patient and
/// clinician records. The memory variant backs tests and the degraded
/// no-database mode (where it starts empty, so every identify fails
/// closed until seeded).
#[derive(Clone)]
pub enum IdentityDirectory {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<(i64, Role), String>>>),
}

impl IdentityDirectory {
    pub fn postgres(pool: PgPool) -> Self {
        Self::Postgres(pool)
    }

    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn display_name(&self, user_id: i64, role: Role) -> Result<Option<String>> {
        match self {
            Self::Postgres(pool) => {
                let sql = match role {
                    Role::Patient => "SELECT display_name FROM patients WHERE id = $1",
                    Role::Clinician => "SELECT display_name FROM clinicians WHERE id = $1",
                };
                sqlx::query_scalar::<_, String>(sql)
                    .bind(user_id)
                    .fetch_optional(pool)
                    .await
                    .context("failed to resolve display name for identify")
            }
            Self::Memory(directory) => {
                Ok(directory.read().await.get(&(user_id, role)).cloned())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn seed_for_tests(
        &self,
        user_id: i64,
        role: Role,
        display_name: impl Into<String>,
    ) {
        if let Self::Memory(directory) = self {
            directory.write().await.insert((user_id, role), display_name.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_user_resolves_to_none() {
        let directory = IdentityDirectory::in_memory();
        let resolved = directory
            .display_name(7, Role::Patient)
            .await
            .expect("memory lookup should not error");
        assert_eq!(resolved, None);
    }

    #[tokio::test]
    async fn seeded_user_resolves_per_role() {
        let directory = IdentityDirectory::in_memory();
        directory.seed_for_tests(7, Role::Patient, "Ana Garza").await;

        let as_patient = directory
            .display_name(7, Role::Patient)
            .await
            .expect("memory lookup should not error");
        let as_clinician = directory
            .display_name(7, Role::Clinician)
            .await
            .expect("memory lookup should not error");

        assert_eq!(as_patient.as_deref(), Some("Ana Garza"));
        assert_eq!(as_clinician, None);
    }
}
