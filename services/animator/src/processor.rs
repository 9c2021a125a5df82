//! Processing state machine: upload registration and `process(job_id)`.
//!
//! ```text
//! no record ──insert──▶ created ──claim──▶ processing ──commit──▶ output_ready
//!                          ▲                    │
//!                          └──── failed ◀───────┘
//! ```
//!
//! A claim is a conditional update on the job row, so only one attempt runs
//! at a time even across processes. Commit and failure writes are guarded by
//! the attempt number, which keeps a displaced stale attempt from touching the
//! record.

use crate::config::Config;
use crate::error::ServiceError;
use crate::job::{BlobRef, CompletedAttempt, Job, JobId, JobState, NewJob};
use crate::job_store::JobStore;
use crate::preview::render_locked_preview;
use crate::storage::{self, Blob, BlobStore, Bucket};
use crate::transform::ImageTransformer;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Upload types accepted for processing
const ACCEPTED_UPLOAD_EXTENSIONS: [&str; 3] = ["jpg", "png", "webp"];

/// Cap on jobs returned for one owner
const MAX_LISTED_JOBS: i64 = 100;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub max_upload_bytes: usize,
    pub preview_enabled: bool,
    pub overlay_alpha: f32,
    /// Age after which an in-progress attempt may be displaced
    pub stale_after: Duration,
}

impl ProcessorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_upload_bytes: config.uploads.max_bytes,
            preview_enabled: config.preview.enabled,
            overlay_alpha: config.preview.overlay_alpha,
            stale_after: config.stale_after(),
        }
    }
}

/// Result of a successful `process` call
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub job_id: JobId,
    pub output_ref: BlobRef,
    pub preview_ref: Option<BlobRef>,
    /// Refs came from an earlier attempt; nothing was transformed
    pub reused: bool,
}

impl ProcessOutcome {
    fn from_job(job: &Job, reused: bool) -> Option<Self> {
        if !job.is_output_ready() {
            return None;
        }
        Some(Self {
            job_id: job.job_id.clone(),
            output_ref: job.output_ref()?,
            preview_ref: job.preview_ref(),
            reused,
        })
    }
}

/// Polling view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub error_message: Option<String>,
    pub purchased: bool,
    pub preview_url: Option<String>,
    /// Only present once purchased
    pub output_url: Option<String>,
}

pub struct Processor {
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    transformer: Arc<dyn ImageTransformer>,
    settings: ProcessorSettings,
}

impl Processor {
    pub fn new(
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        transformer: Arc<dyn ImageTransformer>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            blobs,
            transformer,
            settings,
        }
    }

    /// Create the job record and store the original upload.
    ///
    /// An existing record wins: its bytes are left untouched and the stored
    /// row is returned. If the upload fails the new record is removed again.
    #[instrument(skip(self, blob), fields(job_id = %job_id, size_bytes = blob.bytes.len()))]
    pub async fn register_upload(
        &self,
        job_id: &JobId,
        blob: Blob,
        owner_id: Option<String>,
    ) -> Result<Job, ServiceError> {
        if blob.bytes.is_empty() {
            return Err(ServiceError::Validation("Upload is empty".to_string()));
        }
        if blob.bytes.len() > self.settings.max_upload_bytes {
            return Err(ServiceError::Validation(format!(
                "Upload is {} bytes, maximum is {}",
                blob.bytes.len(),
                self.settings.max_upload_bytes
            )));
        }
        let extension = match storage::extension_for_content_type(&blob.content_type) {
            Some(ext) if ACCEPTED_UPLOAD_EXTENSIONS.contains(&ext) => ext,
            _ => {
                return Err(ServiceError::Validation(format!(
                    "Unsupported content type {}, expected JPEG, PNG or WebP",
                    blob.content_type
                )))
            }
        };

        let input_key = storage::input_key(job_id, extension);
        let content_type = storage::content_type_for_extension(extension).to_string();
        let new_job = NewJob {
            job_id: job_id.clone(),
            input_key: input_key.clone(),
            input_content_type: content_type.clone(),
            owner_id,
        };

        // Only the caller that created the record writes the input bytes
        let Some(job) = self.store.try_insert(&new_job).await? else {
            debug!("Job already registered");
            return self.store.get(job_id).await?.ok_or_else(|| {
                ServiceError::Conflict(format!("Job {} is being registered", job_id))
            });
        };

        if let Err(e) = self
            .blobs
            .put(Bucket::Input, &input_key, Blob::new(blob.bytes, content_type))
            .await
        {
            error!(error = %e, "Input upload failed, removing record");
            if let Err(store_err) = self.store.remove_unclaimed(job_id).await {
                error!(error = %store_err, "Failed to remove record of failed upload");
            }
            return Err(e.into());
        }

        metrics::counter!("animator.uploads.registered").increment(1);
        info!(input_key = %job.input_key, "Upload registered");
        Ok(job)
    }

    /// Create the record for an input uploaded straight to the input bucket
    async fn register_existing_input(&self, job_id: &JobId) -> Result<Job, ServiceError> {
        let input_key = self.blobs.find_input(job_id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("No input uploaded for job {}", job_id))
        })?;

        let extension = input_key.rsplit('.').next().unwrap_or_default();
        let job = self
            .store
            .insert_if_absent(&NewJob {
                job_id: job_id.clone(),
                input_content_type: storage::content_type_for_extension(extension).to_string(),
                input_key,
                owner_id: None,
            })
            .await?;

        debug!(input_key = %job.input_key, "Registered job from existing input");
        Ok(job)
    }

    /// Transform a job's input into output and preview, at most once.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn process(&self, job_id: &JobId) -> Result<ProcessOutcome, ServiceError> {
        let job = match self.store.get(job_id).await? {
            Some(job) => job,
            None => self.register_existing_input(job_id).await?,
        };

        if let Some(outcome) = ProcessOutcome::from_job(&job, true) {
            metrics::counter!("animator.jobs.reused").increment(1);
            debug!("Output already committed");
            return Ok(outcome);
        }

        let stale_before =
            Utc::now() - chrono::Duration::seconds(self.settings.stale_after.as_secs() as i64);

        let claimed = match self.store.begin_attempt(job_id, stale_before).await? {
            Some(claimed) => claimed,
            None => return self.claim_lost(job_id).await,
        };
        let attempt = claimed.attempts;
        info!(attempt, "Processing attempt started");

        let mut written = Vec::new();
        let committed = match self.run_attempt(&claimed, &mut written).await {
            Ok(refs) => self
                .store
                .complete_attempt(job_id, attempt, &refs)
                .await
                .map(|job| (refs, job))
                .map_err(ServiceError::from),
            Err(e) => Err(e),
        };

        match committed {
            Ok((refs, Some(job))) => {
                metrics::counter!("animator.jobs.completed").increment(1);
                info!(attempt, output_key = %refs.output_key, "Processing attempt committed");
                ProcessOutcome::from_job(&job, false).ok_or_else(|| {
                    ServiceError::Upstream(format!("Job {} committed without an output", job_id))
                })
            }
            Ok((_, None)) => {
                warn!(attempt, "Attempt was displaced before commit");
                self.claim_lost(job_id).await
            }
            Err(e) => Err(self.abandon_attempt(job_id, attempt, &written, e).await),
        }
    }

    /// Record a failed attempt and drop the blobs it wrote
    async fn abandon_attempt(
        &self,
        job_id: &JobId,
        attempt: i32,
        written: &[(Bucket, String)],
        e: ServiceError,
    ) -> ServiceError {
        metrics::counter!("animator.jobs.failed").increment(1);
        error!(attempt, error = %e, "Processing attempt failed");

        let recorded = self
            .store
            .fail_attempt(job_id, attempt, &e.to_string())
            .await
            .unwrap_or_else(|store_err| {
                error!(error = %store_err, "Failed to record attempt failure");
                false
            });

        // Blobs of a displaced attempt may share keys with the holder's
        if recorded {
            self.discard(written).await;
        }

        match e {
            ServiceError::NotFound(_) | ServiceError::Upstream(_) | ServiceError::Validation(_) => e,
            other => ServiceError::Upstream(other.to_string()),
        }
    }

    /// Another caller holds or finished the job
    async fn claim_lost(&self, job_id: &JobId) -> Result<ProcessOutcome, ServiceError> {
        let current = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Job {} not found", job_id)))?;

        if let Some(outcome) = ProcessOutcome::from_job(&current, true) {
            return Ok(outcome);
        }

        metrics::counter!("animator.jobs.conflicts").increment(1);
        Err(ServiceError::Conflict(format!(
            "Job {} is already being processed",
            job_id
        )))
    }

    async fn run_attempt(
        &self,
        job: &Job,
        written: &mut Vec<(Bucket, String)>,
    ) -> Result<CompletedAttempt, ServiceError> {
        let input_ref = job.input_ref();
        let stored = self.blobs.get(input_ref.bucket, &input_ref.key).await?;
        let input = Blob::new(stored.bytes, job.input_content_type.clone());

        let output = self.transformer.transform(&input).await?;
        let extension = storage::extension_for_content_type(&output.content_type).unwrap_or("png");
        let output_key = storage::output_key(&job.job_id, extension);

        let preview = if self.settings.preview_enabled {
            let bytes = output.bytes.clone();
            let alpha = self.settings.overlay_alpha;
            let rendered = tokio::task::spawn_blocking(move || render_locked_preview(&bytes, alpha))
                .await
                .map_err(|e| ServiceError::Upstream(format!("Preview task failed: {}", e)))?
                .map_err(|e| ServiceError::Upstream(e.to_string()))?;
            Some((storage::preview_key(&job.job_id), rendered))
        } else {
            None
        };

        let upload_output = self.blobs.put(Bucket::Output, &output_key, output);
        let upload_preview = async {
            match preview {
                Some((ref key, ref bytes)) => {
                    self.blobs
                        .put(Bucket::Preview, key, Blob::new(bytes.clone(), "image/png"))
                        .await
                }
                None => Ok(()),
            }
        };
        let (output_result, preview_result) = futures::join!(upload_output, upload_preview);

        if output_result.is_ok() {
            written.push((Bucket::Output, output_key.clone()));
        }
        let preview_key = preview.map(|(key, _)| key);
        if let (Ok(()), Some(key)) = (&preview_result, &preview_key) {
            written.push((Bucket::Preview, key.clone()));
        }
        output_result?;
        preview_result?;

        Ok(CompletedAttempt {
            output_key,
            preview_key,
        })
    }

    /// Best-effort removal of blobs a failed attempt managed to write
    async fn discard(&self, written: &[(Bucket, String)]) {
        for (bucket, key) in written {
            if let Err(e) = self.blobs.delete(*bucket, key).await {
                warn!(%bucket, %key, error = %e, "Failed to remove orphaned blob");
            }
        }
    }

    /// Polling view with retrievable URLs
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn status(&self, job_id: &JobId) -> Result<JobStatus, ServiceError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Job {} not found", job_id)))?;

        self.view(job).await
    }

    /// Polling views of an owner's jobs, newest first
    #[instrument(skip(self))]
    pub async fn jobs_for_owner(&self, owner_id: &str) -> Result<Vec<JobStatus>, ServiceError> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(ServiceError::Validation("Owner id must not be empty".to_string()));
        }

        let jobs = self.store.list_by_owner(owner_id, MAX_LISTED_JOBS).await?;
        let mut views = Vec::with_capacity(jobs.len());
        for job in jobs {
            views.push(self.view(job).await?);
        }
        debug!(count = views.len(), "Listed owner jobs");
        Ok(views)
    }

    async fn view(&self, job: Job) -> Result<JobStatus, ServiceError> {
        let preview_url = match job.preview_ref() {
            Some(preview) => Some(self.blobs.url(preview.bucket, &preview.key).await?),
            None => None,
        };
        let output_url = match job.output_ref() {
            Some(output) if job.purchased => Some(self.blobs.url(output.bucket, &output.key).await?),
            _ => None,
        };

        Ok(JobStatus {
            job_id: job.job_id,
            state: job.state,
            error_message: job.error_message,
            purchased: job.purchased,
            preview_url,
            output_url,
        })
    }
}
