//! Beneficiary lookup model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of the beneficiary lookup table.
///
/// `upstream_id` is the upstream FHIR server's identifier for this person;
/// it may be absent and is then resolved on demand from the MBI.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CclfBeneficiaryDbModel {
    pub id: i64,
    /// Stable beneficiary identifier used for upstream-id resolution.
    pub mbi: String,
    pub upstream_id: Option<String>,
}
