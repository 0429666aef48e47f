//! Upstream FHIR service interface.
//!
//! The worker only depends on the [`UpstreamClient`] trait; the shipped
//! reqwest implementation lives in [`fhir`]. Tests substitute their own.

pub mod fhir;

pub use fhir::{FhirClient, FhirClientConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::Result;
use crate::domain::ClaimsWindow;

/// The upstream response container: a sequence of entries each wrapping one
/// resource JSON value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub entry: Vec<BundleEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleEntry {
    /// Absent for entries that carry only search metadata.
    #[serde(default)]
    pub resource: Option<Value>,
}

/// Build a FHIR OperationOutcome for one failed beneficiary, written as a
/// line of the error artifact.
pub fn operation_outcome(diagnostics: &str) -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [
            {
                "severity": "error",
                "code": "exception",
                "diagnostics": diagnostics,
            }
        ]
    })
}

/// Per-call context derived from the queue entry being processed.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The upstream service's identifier for the beneficiary.
    pub upstream_id: String,
    pub job_id: i64,
    /// Identifier the upstream service knows the tenant by.
    pub cms_id: String,
    /// Per-job FHIR base path (API version selection).
    pub base_path: String,
    pub since: Option<DateTime<Utc>>,
    pub transaction_time: DateTime<Utc>,
}

/// Fetches resource bundles for one beneficiary at a time.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn get_patient(&self, ctx: &RequestContext) -> Result<Bundle>;
    async fn get_coverage(&self, ctx: &RequestContext) -> Result<Bundle>;
    async fn get_explanation_of_benefit(
        &self,
        ctx: &RequestContext,
        window: ClaimsWindow,
    ) -> Result<Bundle>;
    /// Resolve a beneficiary's upstream identifier from their MBI.
    async fn lookup_upstream_id(&self, mbi: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_outcome_shape() {
        let outcome = operation_outcome("boom");
        assert_eq!(outcome["resourceType"], "OperationOutcome");
        assert_eq!(outcome["issue"][0]["severity"], "error");
        assert_eq!(outcome["issue"][0]["diagnostics"], "boom");
    }

    #[test]
    fn bundle_tolerates_missing_fields() {
        let bundle: Bundle = serde_json::from_str(r#"{"resourceType":"Bundle"}"#).unwrap();
        assert!(bundle.entry.is_empty());

        let bundle: Bundle =
            serde_json::from_str(r#"{"entry":[{"fullUrl":"x"},{"resource":{"id":"1"}}]}"#).unwrap();
        assert_eq!(bundle.entry.len(), 2);
        assert!(bundle.entry[0].resource.is_none());
        assert_eq!(bundle.entry[1].resource.as_ref().unwrap()["id"], "1");
    }
}
