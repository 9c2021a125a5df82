//! Paywall: charge intent creation, payment verification and unlock.
//!
//! Unlocking is a compare-and-set on `purchased`, so the client-side verify
//! call and the webhook can both run for the same charge without harm.

use crate::error::ServiceError;
use crate::job::{ChargeStatus, Job, JobId};
use crate::job_store::JobStore;
use crate::payments::{ChargeIntent, IntentStatus, NewChargeIntent, PaymentProcessor};
use crate::storage::{BlobStore, Bucket};
use crate::webhook::{EventIntent, WebhookEvent};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Handle the payment UI needs to confirm a charge
#[derive(Debug, Clone, Serialize)]
pub struct ChargeSession {
    pub client_secret: String,
    pub charge_intent_id: String,
    pub amount: i64,
    pub currency: String,
    /// A pending intent was reused instead of creating a new one
    pub reused: bool,
}

/// Retrievable full-resolution asset
#[derive(Debug, Clone, Serialize)]
pub struct UnlockedAsset {
    pub job_id: JobId,
    pub url: String,
}

pub struct Checkout {
    store: Arc<dyn JobStore>,
    payments: Arc<dyn PaymentProcessor>,
    blobs: Arc<dyn BlobStore>,
}

impl Checkout {
    pub fn new(
        store: Arc<dyn JobStore>,
        payments: Arc<dyn PaymentProcessor>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            store,
            payments,
            blobs,
        }
    }

    async fn load(&self, job_id: &JobId) -> Result<Job, ServiceError> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Job {} not found", job_id)))
    }

    /// Reuse the job's pending intent if the payment UI can still confirm it at
    /// the current price
    async fn reusable_intent(&self, job: &Job, amount: i64) -> Option<ChargeIntent> {
        if job.charge_status != Some(ChargeStatus::Pending) {
            return None;
        }
        let intent_id = job.charge_intent_id.as_deref()?;

        match self.payments.retrieve_intent(intent_id).await {
            Ok(intent)
                if intent.status.is_awaitable()
                    && intent.amount == amount
                    && intent.job_id() == Some(job.job_id.as_str()) =>
            {
                Some(intent)
            }
            Ok(intent) => {
                debug!(
                    intent_id = %intent.id,
                    status = ?intent.status,
                    "Pending intent no longer reusable"
                );
                None
            }
            Err(e) => {
                warn!(intent_id, error = %e, "Failed to retrieve pending intent, creating a new one");
                None
            }
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn create_charge_intent(
        &self,
        job_id: &JobId,
        owner_id: Option<String>,
    ) -> Result<ChargeSession, ServiceError> {
        let job = self.load(job_id).await?;

        if !job.is_output_ready() {
            return Err(ServiceError::Validation(format!(
                "Job {} has not finished processing",
                job_id
            )));
        }
        if job.purchased {
            return Err(ServiceError::Validation(format!(
                "Job {} is already purchased",
                job_id
            )));
        }

        let price = self.payments.fetch_price().await?;
        let amount = price.amount()?;

        if let Some(intent) = self.reusable_intent(&job, amount).await {
            info!(intent_id = %intent.id, "Reusing pending charge intent");
            return session(intent, true);
        }

        let intent = self
            .payments
            .create_intent(&NewChargeIntent {
                job_id: job_id.clone(),
                owner_id,
                price,
            })
            .await?;

        if !self
            .store
            .record_charge_intent(job_id, &intent.id, intent.amount)
            .await?
        {
            return Err(ServiceError::Validation(format!(
                "Job {} was purchased while creating the charge",
                job_id
            )));
        }

        metrics::counter!("animator.payments.intents_created").increment(1);
        session(intent, false)
    }

    /// Confirm a charge with the processor and flip `purchased`.
    ///
    /// Nothing the client sends is trusted beyond the intent id: status, amount
    /// and the job id metadata all come from the processor.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn verify_and_unlock(
        &self,
        job_id: &JobId,
        charge_intent_id: &str,
    ) -> Result<Job, ServiceError> {
        let job = self.load(job_id).await?;
        if job.purchased {
            debug!("Job already purchased");
            return Ok(job);
        }

        let intent = self.payments.retrieve_intent(charge_intent_id).await?;

        if intent.status != IntentStatus::Succeeded {
            return Err(integrity_violation(format!(
                "Charge {} has status {:?}, expected succeeded",
                intent.id, intent.status
            )));
        }

        let price = self.payments.fetch_price().await?;
        let expected = price.amount()?;
        if intent.amount != expected {
            return Err(integrity_violation(format!(
                "Charge {} amount {} does not match price {}",
                intent.id, intent.amount, expected
            )));
        }

        if intent.job_id() != Some(job_id.as_str()) {
            return Err(integrity_violation(format!(
                "Charge {} belongs to job {:?}, not {}",
                intent.id,
                intent.job_id(),
                job_id
            )));
        }

        match self
            .store
            .mark_purchased(job_id, &intent.id, intent.amount)
            .await?
        {
            Some(job) => {
                metrics::counter!("animator.payments.unlocked").increment(1);
                info!(intent_id = %intent.id, amount = intent.amount, "Job unlocked");
                Ok(job)
            }
            // Lost the race to another verifier
            None => self.load(job_id).await,
        }
    }

    /// Move a pending charge back to unpurchased after the processor reported failure
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn record_failed_charge(
        &self,
        job_id: &JobId,
        charge_intent_id: &str,
    ) -> Result<bool, ServiceError> {
        let changed = self
            .store
            .mark_charge_failed(job_id, charge_intent_id)
            .await?;
        if changed {
            metrics::counter!("animator.payments.failed").increment(1);
            info!(charge_intent_id, "Charge failed, job back to unpurchased");
        }
        Ok(changed)
    }

    /// Apply a verified webhook event. Failures are logged, never returned, so
    /// the processor is always acknowledged.
    pub async fn handle_webhook_event(&self, event: WebhookEvent) {
        match event {
            WebhookEvent::PaymentSucceeded(intent) => {
                let Some(job_id) = intent_job_id(&intent) else {
                    return;
                };
                if let Err(e) = self.verify_and_unlock(&job_id, &intent.id).await {
                    error!(%job_id, intent_id = %intent.id, error = %e, "Webhook unlock failed");
                }
            }
            WebhookEvent::PaymentFailed(intent) => {
                let Some(job_id) = intent_job_id(&intent) else {
                    return;
                };
                warn!(%job_id, intent_id = %intent.id, "Payment failed");
                if let Err(e) = self.record_failed_charge(&job_id, &intent.id).await {
                    error!(%job_id, intent_id = %intent.id, error = %e, "Failed to record failed charge");
                }
            }
            WebhookEvent::Ignored { event_type } => {
                debug!(%event_type, "Ignoring webhook event");
            }
        }
    }

    /// URL of the full-resolution output; requires a purchase
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn unlock(&self, job_id: &JobId) -> Result<UnlockedAsset, ServiceError> {
        let job = self.load(job_id).await?;

        let output = match job.output_ref() {
            Some(output) if job.is_output_ready() => output,
            _ => {
                return Err(ServiceError::NotFound(format!(
                    "Job {} has not finished processing",
                    job_id
                )))
            }
        };

        if !job.purchased {
            return Err(ServiceError::Forbidden(format!(
                "Job {} has not been purchased",
                job_id
            )));
        }

        let url = self.blobs.url(Bucket::Output, &output.key).await?;
        Ok(UnlockedAsset {
            job_id: job.job_id,
            url,
        })
    }
}

fn session(intent: ChargeIntent, reused: bool) -> Result<ChargeSession, ServiceError> {
    let client_secret = intent.client_secret.ok_or_else(|| {
        ServiceError::Upstream(format!("Charge intent {} has no client secret", intent.id))
    })?;

    Ok(ChargeSession {
        client_secret,
        charge_intent_id: intent.id,
        amount: intent.amount,
        currency: intent.currency,
        reused,
    })
}

fn integrity_violation(message: String) -> ServiceError {
    warn!(%message, "Rejected payment verification");
    metrics::counter!("animator.payments.rejected").increment(1);
    ServiceError::Integrity(message)
}

fn intent_job_id(intent: &EventIntent) -> Option<JobId> {
    match intent.job_id().map(JobId::parse) {
        Some(Ok(job_id)) => Some(job_id),
        _ => {
            warn!(intent_id = %intent.id, "Webhook intent has no usable job id");
            None
        }
    }
}
