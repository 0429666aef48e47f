//! Database models.

pub mod beneficiary;
pub mod job;
pub mod queue;

pub use beneficiary::CclfBeneficiaryDbModel;
pub use job::{AcoDbModel, JobDbModel, JobKeyDbModel, NewJob};
pub use queue::QueueEntryDbModel;
