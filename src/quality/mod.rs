//! Quality pipeline: N agent roles run concurrently over one changeset, then
//! aggregated into a single [`QualityReport`].
//!
//! # Example
//!
//! ```rust,ignore
//! use swe_conductor::quality::QualityPipeline;
//!
//! let quality = QualityPipeline::new(executor, roles, bus).with_breaker(breaker);
//! let report = quality
//!     .run(&request.request_id, &request, tier, &agents, &stats, &cancel)
//!     .await;
//! if !report.passed() {
//!     println!("failing agents: {:?}", report.failing_agents());
//! }
//! ```

pub mod pipeline;
pub mod report;

pub use pipeline::QualityPipeline;
pub use report::{aggregate, AppliedCorrection, QualityReport};
