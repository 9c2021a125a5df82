//! Ownership migration from anonymous sessions to signed-in identities.
//!
//! Two entry points: cookie-tracked job lists claim only unowned jobs, and
//! identity merges move every job of one owner to another. Sign-in completion
//! wraps the merge with a persisted marker so a failed merge is retried on the
//! next sign-in instead of being lost.

use crate::error::ServiceError;
use crate::job::{JobId, MigrationMarker};
use crate::job_store::JobStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Outcome of a cookie-list migration
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieMigrationReport {
    pub migrated: Vec<JobId>,
    pub already_claimed: Vec<JobId>,
    pub not_found: Vec<JobId>,
}

/// Outcome of the post-sign-in hook
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignInOutcome {
    /// Identity carried over; nothing to move
    Linked,
    /// Jobs moved from earlier identities
    Merged { migrated: u64 },
    /// Some migrations failed and stay queued for the next sign-in
    Pending { from_owners: Vec<String> },
}

fn require_owner(owner: &str, field: &str) -> Result<(), ServiceError> {
    if owner.trim().is_empty() {
        return Err(ServiceError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

pub struct Migrator {
    store: Arc<dyn JobStore>,
    max_batch: usize,
}

impl Migrator {
    pub fn new(store: Arc<dyn JobStore>, max_batch: usize) -> Self {
        Self { store, max_batch }
    }

    /// Claim the listed jobs for `to_owner` where they have no owner yet
    #[instrument(skip(self, job_ids), fields(count = job_ids.len()))]
    pub async fn migrate_cookie_jobs(
        &self,
        job_ids: &[String],
        to_owner: &str,
    ) -> Result<CookieMigrationReport, ServiceError> {
        require_owner(to_owner, "to_owner")?;
        if job_ids.is_empty() {
            return Err(ServiceError::Validation("No job ids given".to_string()));
        }
        if job_ids.len() > self.max_batch {
            return Err(ServiceError::Validation(format!(
                "At most {} job ids per request, got {}",
                self.max_batch,
                job_ids.len()
            )));
        }

        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(job_ids.len());
        for raw in job_ids {
            let id = JobId::parse(raw.as_str())?;
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }

        let owners: HashMap<JobId, Option<String>> =
            self.store.owners_of(&ids).await?.into_iter().collect();

        let mut report = CookieMigrationReport::default();
        let mut candidates = Vec::new();
        for id in ids {
            match owners.get(&id) {
                None => report.not_found.push(id),
                Some(None) => candidates.push(id),
                // Re-running a finished migration reports the same result
                Some(Some(owner)) if owner == to_owner => report.migrated.push(id),
                Some(Some(_)) => report.already_claimed.push(id),
            }
        }

        if !candidates.is_empty() {
            let claimed: HashSet<JobId> = self
                .store
                .claim_unowned(&candidates, to_owner)
                .await?
                .into_iter()
                .collect();

            for id in candidates {
                if claimed.contains(&id) {
                    report.migrated.push(id);
                } else {
                    // Claimed by someone else between the read and the guarded update
                    report.already_claimed.push(id);
                }
            }
        }

        metrics::counter!("animator.migrations.cookie_jobs")
            .increment(report.migrated.len() as u64);
        info!(
            migrated = report.migrated.len(),
            already_claimed = report.already_claimed.len(),
            not_found = report.not_found.len(),
            "Cookie migration finished"
        );
        Ok(report)
    }

    /// Move every job owned by `from_owner` to `to_owner`
    #[instrument(skip(self))]
    pub async fn migrate_identity(
        &self,
        from_owner: &str,
        to_owner: &str,
    ) -> Result<u64, ServiceError> {
        require_owner(from_owner, "from_owner")?;
        require_owner(to_owner, "to_owner")?;
        if from_owner == to_owner {
            return Err(ServiceError::Validation(
                "Source and target identity are the same".to_string(),
            ));
        }

        let moved = self.store.reassign_owner(from_owner, to_owner).await?;
        metrics::counter!("animator.migrations.identity_jobs").increment(moved);
        info!(moved, "Identity migration finished");
        Ok(moved)
    }

    /// Post-sign-in hook. Migration failures never fail the sign-in; they
    /// leave a marker that the next call retries.
    #[instrument(skip(self))]
    pub async fn complete_sign_in(
        &self,
        previous_owner: Option<&str>,
        new_owner: &str,
    ) -> Result<SignInOutcome, ServiceError> {
        require_owner(new_owner, "new_owner")?;

        let mut markers = self.store.pending_markers(new_owner).await.unwrap_or_else(|e| {
            error!(error = %e, "Failed to read pending migrations");
            Vec::new()
        });

        if let Some(previous) = previous_owner.filter(|p| !p.trim().is_empty() && *p != new_owner) {
            match self.store.put_marker(previous, new_owner).await {
                Ok(marker) => {
                    markers.retain(|m| m.from_owner != marker.from_owner);
                    markers.push(marker);
                }
                Err(e) => {
                    error!(error = %e, "Failed to persist pending migration");
                    markers.push(MigrationMarker {
                        from_owner: previous.to_string(),
                        to_owner: new_owner.to_string(),
                        created_at: chrono::Utc::now(),
                    });
                }
            }
        }

        if markers.is_empty() {
            return Ok(SignInOutcome::Linked);
        }

        let mut migrated = 0;
        let mut outstanding = Vec::new();
        for marker in markers {
            match self.migrate_identity(&marker.from_owner, &marker.to_owner).await {
                Ok(moved) => {
                    migrated += moved;
                    if let Err(e) = self.store.clear_marker(&marker).await {
                        // The merge is idempotent, so a leftover marker only costs a no-op retry
                        warn!(from_owner = %marker.from_owner, error = %e, "Failed to clear migration marker");
                    }
                }
                Err(e) => {
                    warn!(from_owner = %marker.from_owner, error = %e, "Migration failed, will retry on next sign-in");
                    outstanding.push(marker.from_owner);
                }
            }
        }

        if outstanding.is_empty() {
            Ok(SignInOutcome::Merged { migrated })
        } else {
            metrics::counter!("animator.migrations.deferred").increment(outstanding.len() as u64);
            Ok(SignInOutcome::Pending {
                from_owners: outstanding,
            })
        }
    }

    /// Migrations still queued for `owner`
    pub async fn pending_for(&self, owner: &str) -> Result<Vec<MigrationMarker>, ServiceError> {
        require_owner(owner, "owner")?;
        Ok(self.store.pending_markers(owner).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use crate::job_store::{MockJobStore, StoreError};
    use crate::memory_store::MemoryJobStore;

    async fn seed(store: &MemoryJobStore, id: &str, owner: Option<&str>) {
        store
            .insert_if_absent(&NewJob {
                job_id: JobId::parse(id).unwrap(),
                input_key: format!("{id}.png"),
                input_content_type: "image/png".to_string(),
                owner_id: owner.map(String::from),
            })
            .await
            .unwrap();
    }

    fn ids(raw: &[&str]) -> Vec<JobId> {
        raw.iter().map(|id| JobId::parse(*id).unwrap()).collect()
    }

    async fn owner(store: &MemoryJobStore, id: &str) -> Option<String> {
        store
            .get(&JobId::parse(id).unwrap())
            .await
            .unwrap()
            .unwrap()
            .owner_id
    }

    #[tokio::test]
    async fn test_cookie_migration_sorts_ids() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "x", None).await;
        seed(&store, "y", Some("other")).await;
        let migrator = Migrator::new(store.clone(), 100);

        let raw: Vec<String> = vec!["x".into(), "y".into(), "z".into()];
        let report = migrator.migrate_cookie_jobs(&raw, "user-1").await.unwrap();

        assert_eq!(report.migrated, ids(&["x"]));
        assert_eq!(report.already_claimed, ids(&["y"]));
        assert_eq!(report.not_found, ids(&["z"]));
        assert_eq!(owner(&store, "x").await.as_deref(), Some("user-1"));
        assert_eq!(owner(&store, "y").await.as_deref(), Some("other"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"migrated": ["x"], "alreadyClaimed": ["y"], "notFound": ["z"]})
        );
    }

    #[tokio::test]
    async fn test_cookie_migration_is_repeatable_and_dedupes() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "x", None).await;
        let migrator = Migrator::new(store, 100);

        let raw: Vec<String> = vec!["x".into(), "x".into()];
        let first = migrator.migrate_cookie_jobs(&raw, "user-1").await.unwrap();
        let second = migrator.migrate_cookie_jobs(&raw, "user-1").await.unwrap();

        assert_eq!(first.migrated, ids(&["x"]));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_cookie_migration_reports_lost_race_as_claimed() {
        let mut store = MockJobStore::new();
        store
            .expect_owners_of()
            .returning(|ids| Ok(ids.iter().map(|id| (id.clone(), None)).collect()));
        store.expect_claim_unowned().returning(|_, _| Ok(Vec::new()));
        let migrator = Migrator::new(Arc::new(store), 100);

        let report = migrator
            .migrate_cookie_jobs(&["x".to_string()], "user-1")
            .await
            .unwrap();
        assert!(report.migrated.is_empty());
        assert_eq!(report.already_claimed, ids(&["x"]));
    }

    #[tokio::test]
    async fn test_cookie_migration_validates_before_querying() {
        // Any store call would panic
        let migrator = Migrator::new(Arc::new(MockJobStore::new()), 2);

        let too_many: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        assert!(matches!(
            migrator.migrate_cookie_jobs(&too_many, "user-1").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            migrator
                .migrate_cookie_jobs(&["../etc".to_string()], "user-1")
                .await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            migrator.migrate_cookie_jobs(&[], "user-1").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            migrator.migrate_cookie_jobs(&["a".to_string()], " ").await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_identity_migration_rejects_same_identity() {
        let migrator = Migrator::new(Arc::new(MockJobStore::new()), 100);
        assert!(matches!(
            migrator.migrate_identity("anon1", "anon1").await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_identity_migration_moves_only_matching_owner() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "a", Some("anon1")).await;
        seed(&store, "b", Some("anon1")).await;
        seed(&store, "c", Some("someone")).await;
        seed(&store, "d", None).await;
        let migrator = Migrator::new(store.clone(), 100);

        assert_eq!(migrator.migrate_identity("anon1", "user-1").await.unwrap(), 2);
        assert_eq!(migrator.migrate_identity("anon1", "user-1").await.unwrap(), 0);
        assert_eq!(owner(&store, "c").await.as_deref(), Some("someone"));
        assert_eq!(owner(&store, "d").await, None);
    }

    #[tokio::test]
    async fn test_sign_in_links_and_merges() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "a", Some("anon1")).await;
        let migrator = Migrator::new(store.clone(), 100);

        assert_eq!(
            migrator.complete_sign_in(Some("anon1"), "anon1").await.unwrap(),
            SignInOutcome::Linked
        );
        assert_eq!(
            migrator.complete_sign_in(None, "anon1").await.unwrap(),
            SignInOutcome::Linked
        );

        assert_eq!(
            migrator.complete_sign_in(Some("anon1"), "user-1").await.unwrap(),
            SignInOutcome::Merged { migrated: 1 }
        );
        assert_eq!(owner(&store, "a").await.as_deref(), Some("user-1"));
        assert!(migrator.pending_for("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_merge_keeps_marker_and_sign_in_succeeds() {
        let mut store = MockJobStore::new();
        store.expect_pending_markers().returning(|_| Ok(Vec::new()));
        store.expect_put_marker().times(1).returning(|from, to| {
            Ok(MigrationMarker {
                from_owner: from.to_string(),
                to_owner: to.to_string(),
                created_at: chrono::Utc::now(),
            })
        });
        store
            .expect_reassign_owner()
            .returning(|_, _| Err(StoreError::Inconsistent("connection reset".to_string())));
        store.expect_clear_marker().never();
        let migrator = Migrator::new(Arc::new(store), 100);

        let outcome = migrator.complete_sign_in(Some("anon1"), "user-1").await.unwrap();
        assert_eq!(
            outcome,
            SignInOutcome::Pending {
                from_owners: vec!["anon1".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_sign_in_retries_outstanding_markers() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "a", Some("anon1")).await;
        store.put_marker("anon1", "user-1").await.unwrap();
        let migrator = Migrator::new(store.clone(), 100);

        assert_eq!(migrator.pending_for("user-1").await.unwrap().len(), 1);

        let outcome = migrator.complete_sign_in(None, "user-1").await.unwrap();
        assert_eq!(outcome, SignInOutcome::Merged { migrated: 1 });
        assert!(migrator.pending_for("user-1").await.unwrap().is_empty());
    }
}
