//! The export pipeline: queue consumers, per-entry processing, artifact
//! streaming and cancellation monitoring.

pub mod artifact;
pub mod cancellation;
pub mod worker;
pub mod worker_pool;

pub use artifact::{ArtifactWriter, BLANK_ARTIFACT_NAME};
pub use cancellation::CancellationMonitor;
pub use worker::{Disposition, ExportWorker, WorkerConfig};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
