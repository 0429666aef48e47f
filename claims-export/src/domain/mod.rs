//! Domain types shared between the queue payload, the worker and the
//! persistence layer.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Status of a parent export job.
///
/// Transitions form a DAG: `Pending -> InProgress -> {Completed, Failed}`,
/// with `Cancelled` reachable from `Pending` or `InProgress` only. Terminal
/// statuses are final; every transition that can race goes through a
/// compare-and-set in the job repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job was admitted but no worker has picked up an entry yet.
    Pending,
    /// At least one queue entry has started processing.
    InProgress,
    /// Cancelled externally; workers drop in-flight entries for it.
    Cancelled,
    /// A queue entry failed hard (threshold breach or terminal error).
    Failed,
    /// Every queue entry produced its job key and artifacts were promoted.
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        }
    }

    /// Terminal statuses are never overwritten.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Completed)
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "CANCELLED" => Ok(Self::Cancelled),
            "FAILED" => Ok(Self::Failed),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(Error::Other(format!("Unrecognized job status: {other}"))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FHIR resource type a queue entry exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Coverage,
    ExplanationOfBenefit,
    Patient,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coverage => "Coverage",
            Self::ExplanationOfBenefit => "ExplanationOfBenefit",
            Self::Patient => "Patient",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service-date bounds applied to ExplanationOfBenefit searches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimsWindow {
    #[serde(default)]
    pub lower_bound: Option<DateTime<Utc>>,
    #[serde(default)]
    pub upper_bound: Option<DateTime<Utc>>,
}

impl ClaimsWindow {
    /// Older enqueuers set only `service_date`; when both bounds are absent
    /// it becomes the upper bound so their entries keep exporting the same
    /// claims.
    pub fn or_service_date(self, service_date: Option<DateTime<Utc>>) -> Self {
        if self.lower_bound.is_none() && self.upper_bound.is_none() {
            Self {
                lower_bound: None,
                upper_bound: service_date,
            }
        } else {
            self
        }
    }
}

/// The queue payload: everything a worker needs to process one beneficiary
/// slice of a parent export job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportArgs {
    pub job_id: i64,
    /// Owner/tenant identifier (ACO UUID).
    pub aco_id: String,
    pub resource_type: ResourceType,
    /// Ordered; NDJSON output preserves this order.
    pub beneficiary_ids: Vec<String>,
    /// Upstream FHIR base path (e.g. "/v2/fhir"). Selects the API version.
    pub upstream_base_path: String,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    pub transaction_time: DateTime<Utc>,
    #[serde(default)]
    pub claims_window: ClaimsWindow,
    /// Legacy field kept for the `claims_window` fallback.
    #[serde(default)]
    pub service_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Cancelled,
            JobStatus::Failed,
            JobStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("BOGUS".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
    }

    #[test]
    fn claims_window_falls_back_to_service_date() {
        let service_date = Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());

        let window = ClaimsWindow::default().or_service_date(service_date);
        assert_eq!(window.upper_bound, service_date);
        assert_eq!(window.lower_bound, None);

        // Explicit bounds win over the legacy field.
        let explicit = ClaimsWindow {
            lower_bound: Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
            upper_bound: None,
        };
        assert_eq!(explicit.or_service_date(service_date), explicit);
    }

    #[test]
    fn export_args_decode_defaults_optional_fields() {
        let raw = r#"{
            "job_id": 7,
            "aco_id": "a40404f7-1ef2-485a-9b71-40fe7acdcbc2",
            "resource_type": "ExplanationOfBenefit",
            "beneficiary_ids": ["1", "2"],
            "upstream_base_path": "/v2/fhir",
            "transaction_time": "2024-03-01T00:00:00Z"
        }"#;
        let args: ExportArgs = serde_json::from_str(raw).unwrap();
        assert_eq!(args.job_id, 7);
        assert_eq!(args.resource_type, ResourceType::ExplanationOfBenefit);
        assert_eq!(args.since, None);
        assert_eq!(args.claims_window, ClaimsWindow::default());
        assert_eq!(args.service_date, None);
    }
}
