//! In-process [`JobStore`] with the same guards as the Postgres queries.
//!
//! Each operation runs under one lock, which plays the role of the row lock a
//! conditional `UPDATE` takes in Postgres.

use crate::job::{ChargeStatus, CompletedAttempt, Job, JobId, JobState, MigrationMarker, NewJob};
use crate::job_store::{JobStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    markers: HashMap<String, MigrationMarker>,
}

fn new_row(job: &NewJob) -> Job {
    let now = Utc::now();
    Job {
        job_id: job.job_id.clone(),
        input_key: job.input_key.clone(),
        input_content_type: job.input_content_type.clone(),
        output_key: None,
        preview_key: None,
        owner_id: job.owner_id.clone(),
        state: JobState::Created,
        error_message: None,
        attempts: 0,
        processing_started_at: None,
        purchased: false,
        charge_intent_id: None,
        charge_status: None,
        charge_amount: None,
        purchased_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_if_absent(&self, job: &NewJob) -> StoreResult<Job> {
        let mut tables = self.tables.lock();
        let row = tables
            .jobs
            .entry(job.job_id.clone())
            .or_insert_with(|| new_row(job));
        Ok(row.clone())
    }

    async fn try_insert(&self, job: &NewJob) -> StoreResult<Option<Job>> {
        let mut tables = self.tables.lock();
        if tables.jobs.contains_key(&job.job_id) {
            return Ok(None);
        }
        let row = new_row(job);
        tables.jobs.insert(job.job_id.clone(), row.clone());
        Ok(Some(row))
    }

    async fn remove_unclaimed(&self, job_id: &JobId) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.jobs.get(job_id) {
            Some(job) if job.state == JobState::Created && job.attempts == 0 => {
                tables.jobs.remove(job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.tables.lock().jobs.get(job_id).cloned())
    }

    async fn list_by_owner(&self, owner_id: &str, limit: i64) -> StoreResult<Vec<Job>> {
        let tables = self.tables.lock();
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| job.owner_id.as_deref() == Some(owner_id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.as_str().cmp(b.job_id.as_str()))
        });
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }

    async fn begin_attempt(
        &self,
        job_id: &JobId,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        let mut tables = self.tables.lock();
        let Some(job) = tables.jobs.get_mut(job_id) else {
            return Ok(None);
        };

        let claimable = job.output_key.is_none()
            && match job.state {
                JobState::Created | JobState::Failed => true,
                JobState::Processing => job
                    .processing_started_at
                    .map(|started| started < stale_before)
                    .unwrap_or(false),
                JobState::OutputReady => false,
            };
        if !claimable {
            return Ok(None);
        }

        let now = Utc::now();
        job.state = JobState::Processing;
        job.attempts += 1;
        job.error_message = None;
        job.processing_started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_attempt(
        &self,
        job_id: &JobId,
        attempt: i32,
        refs: &CompletedAttempt,
    ) -> StoreResult<Option<Job>> {
        let mut tables = self.tables.lock();
        let Some(job) = tables.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.state != JobState::Processing || job.attempts != attempt || job.output_key.is_some()
        {
            return Ok(None);
        }

        job.state = JobState::OutputReady;
        job.output_key = Some(refs.output_key.clone());
        job.preview_key = refs.preview_key.clone();
        job.error_message = None;
        job.processing_started_at = None;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn fail_attempt(
        &self,
        job_id: &JobId,
        attempt: i32,
        message: &str,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let Some(job) = tables.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.state != JobState::Processing || job.attempts != attempt {
            return Ok(false);
        }

        job.state = JobState::Failed;
        job.error_message = Some(message.to_string());
        job.processing_started_at = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_charge_intent(
        &self,
        job_id: &JobId,
        intent_id: &str,
        amount: i64,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.jobs.get_mut(job_id) {
            Some(job) if !job.purchased => {
                job.charge_intent_id = Some(intent_id.to_string());
                job.charge_status = Some(ChargeStatus::Pending);
                job.charge_amount = Some(amount);
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_purchased(
        &self,
        job_id: &JobId,
        intent_id: &str,
        amount: i64,
    ) -> StoreResult<Option<Job>> {
        let mut tables = self.tables.lock();
        match tables.jobs.get_mut(job_id) {
            Some(job) if !job.purchased => {
                let now = Utc::now();
                job.purchased = true;
                job.charge_intent_id = Some(intent_id.to_string());
                job.charge_status = Some(ChargeStatus::Succeeded);
                job.charge_amount = Some(amount);
                job.purchased_at = Some(now);
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_charge_failed(&self, job_id: &JobId, intent_id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.jobs.get_mut(job_id) {
            Some(job)
                if !job.purchased
                    && job.charge_status == Some(ChargeStatus::Pending)
                    && job.charge_intent_id.as_deref() == Some(intent_id) =>
            {
                job.charge_status = Some(ChargeStatus::Failed);
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn owners_of(&self, job_ids: &[JobId]) -> StoreResult<Vec<(JobId, Option<String>)>> {
        let tables = self.tables.lock();
        Ok(job_ids
            .iter()
            .filter_map(|id| tables.jobs.get(id).map(|job| (id.clone(), job.owner_id.clone())))
            .collect())
    }

    async fn claim_unowned(&self, job_ids: &[JobId], owner_id: &str) -> StoreResult<Vec<JobId>> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let mut claimed = Vec::new();
        for id in job_ids {
            if let Some(job) = tables.jobs.get_mut(id) {
                if job.owner_id.is_none() {
                    job.owner_id = Some(owner_id.to_string());
                    job.updated_at = now;
                    claimed.push(id.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn reassign_owner(&self, from_owner: &str, to_owner: &str) -> StoreResult<u64> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let mut count = 0;
        for job in tables.jobs.values_mut() {
            if job.owner_id.as_deref() == Some(from_owner) {
                job.owner_id = Some(to_owner.to_string());
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn put_marker(&self, from_owner: &str, to_owner: &str) -> StoreResult<MigrationMarker> {
        let marker = MigrationMarker {
            from_owner: from_owner.to_string(),
            to_owner: to_owner.to_string(),
            created_at: Utc::now(),
        };
        self.tables
            .lock()
            .markers
            .insert(from_owner.to_string(), marker.clone());
        Ok(marker)
    }

    async fn pending_markers(&self, to_owner: &str) -> StoreResult<Vec<MigrationMarker>> {
        let tables = self.tables.lock();
        let mut markers: Vec<MigrationMarker> = tables
            .markers
            .values()
            .filter(|m| m.to_owner == to_owner)
            .cloned()
            .collect();
        markers.sort_by_key(|m| m.created_at);
        Ok(markers)
    }

    async fn clear_marker(&self, marker: &MigrationMarker) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.markers.get(&marker.from_owner) {
            Some(existing) if existing.to_owner == marker.to_owner => {
                tables.markers.remove(&marker.from_owner);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
