//! Animator Service
//!
//! Turns an uploaded photo into a stylized animation frame through a
//! generative image API, serves a locked preview, unlocks the full-resolution
//! result after payment, and carries a user's jobs across sign-in.
//!
//! ## Features
//!
//! - **At-most-once processing**: `process(job_id)` claims the job with a
//!   conditional update, so concurrent callers get a conflict instead of a
//!   second paid transformation, and finished jobs return their stored refs
//! - **Locked previews**: darkened, padlocked PNG in its own bucket; the
//!   output is only handed out once `purchased` is set
//! - **Payment reconciliation**: charge intents verified against the processor
//!   (status, amount, job metadata) by both the client and signed webhooks
//! - **Identity migration**: cookie job lists and anonymous identities merge
//!   into the signed-in owner without overwriting anyone else's jobs
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (axum)
//! ┌──────────────┐     ┌──────────────┐      ┌──────────────┐
//! │ /uploads     │     │ Processor    │─────▶│ Image API    │
//! │ /process     │────▶│ (state       │      └──────────────┘
//! │ /jobs        │     │  machine)    │─────▶┌──────────────┐
//! └──────────────┘     └──────────────┘      │ S3 buckets   │
//! ┌──────────────┐     ┌──────────────┐      │ input/output │
//! │ /payment/*   │────▶│ Checkout     │─────▶│ /preview     │
//! │ /unlock      │     └──────────────┘      └──────────────┘
//! └──────────────┘            │  ▲
//! ┌──────────────┐            │  └──── Payment processor
//! │ /migrate/*   │     ┌──────────────┐
//! │ /auth/*      │────▶│ Migrator     │
//! └──────────────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │ PostgreSQL   │
//!                      │ jobs         │
//!                      └──────────────┘
//! ```

pub mod api;
pub mod checkout;
pub mod config;
pub mod dimensions;
pub mod error;
pub mod job;
pub mod job_store;
pub mod memory_store;
pub mod migration;
pub mod payments;
pub mod preview;
pub mod processor;
pub mod storage;
pub mod transform;
pub mod webhook;

pub use api::{create_router, start_api_server, AppState};
pub use checkout::Checkout;
pub use config::Config;
pub use error::{RetryClass, ServiceError};
pub use job::{Job, JobId, JobState};
pub use job_store::{JobStore, PgJobStore};
pub use memory_store::MemoryJobStore;
pub use migration::Migrator;
pub use payments::{PaymentProcessor, StripeClient};
pub use processor::{Processor, ProcessorSettings};
pub use storage::{BlobStore, MemoryBlobStore, S3Gateway};
pub use transform::{ImageTransformer, OpenAiTransformer};
pub use webhook::WebhookVerifier;
