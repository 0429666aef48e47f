//! reqwest-based FHIR client.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tracing::debug;
use url::Url;

use super::{Bundle, RequestContext, UpstreamClient};
use crate::domain::ClaimsWindow;
use crate::{Error, Result};

/// FHIR identifier system for the MBI.
const MBI_SYSTEM: &str = "http://hl7.org/fhir/sid/us-mbi";

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[derive(Debug, Clone)]
pub struct FhirClientConfig {
    /// Upstream origin, e.g. "https://fhir.example.gov".
    pub host: String,
    /// Base path used for MBI lookups; resource calls carry their own.
    pub default_base_path: String,
    pub timeout_secs: u64,
}

/// FHIR search client for the upstream claims data service.
pub struct FhirClient {
    http: reqwest::Client,
    host: Url,
    default_base_path: String,
}

impl FhirClient {
    pub fn new(config: FhirClientConfig) -> Result<Self> {
        install_rustls_provider();

        let host = Url::parse(&config.host)
            .map_err(|e| Error::config(format!("Invalid upstream host '{}': {e}", config.host)))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            host,
            default_base_path: config.default_base_path,
        })
    }

    fn resource_url(&self, base_path: &str, resource_type: &str) -> Result<Url> {
        let path = format!("{}/{}", base_path.trim_matches('/'), resource_type);
        self.host
            .join(&path)
            .map_err(|e| Error::upstream(format!("Invalid resource path '{path}': {e}")))
    }

    async fn search(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        extra_params: &[(&str, String)],
    ) -> Result<Bundle> {
        let url = self.resource_url(&ctx.base_path, resource_type)?;

        let mut params: Vec<(&str, String)> = vec![
            ("patient", ctx.upstream_id.clone()),
            ("_format", "application/fhir+json".to_string()),
            (
                "_lastUpdated",
                format!(
                    "le{}",
                    ctx.transaction_time.to_rfc3339_opts(SecondsFormat::Millis, true)
                ),
            ),
        ];
        if let Some(since) = ctx.since {
            params.push((
                "_lastUpdated",
                format!("ge{}", since.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ));
        }
        params.extend_from_slice(extra_params);

        let bundle = self
            .http
            .get(url)
            .query(&params)
            .header("X-Bulk-Job-Id", ctx.job_id.to_string())
            .header("X-Bulk-Client-Id", &ctx.cms_id)
            .send()
            .await?
            .error_for_status()?
            .json::<Bundle>()
            .await?;

        Ok(bundle)
    }
}

#[async_trait]
impl UpstreamClient for FhirClient {
    async fn get_patient(&self, ctx: &RequestContext) -> Result<Bundle> {
        self.search(ctx, "Patient", &[]).await
    }

    async fn get_coverage(&self, ctx: &RequestContext) -> Result<Bundle> {
        self.search(ctx, "Coverage", &[]).await
    }

    async fn get_explanation_of_benefit(
        &self,
        ctx: &RequestContext,
        window: ClaimsWindow,
    ) -> Result<Bundle> {
        let mut params: Vec<(&str, String)> = vec![("excludeSAMHSA", "true".to_string())];
        if let Some(lower) = window.lower_bound {
            params.push(("service-date", format!("ge{}", lower.format("%Y-%m-%d"))));
        }
        if let Some(upper) = window.upper_bound {
            params.push(("service-date", format!("le{}", upper.format("%Y-%m-%d"))));
        }
        self.search(ctx, "ExplanationOfBenefit", &params).await
    }

    async fn lookup_upstream_id(&self, mbi: &str) -> Result<String> {
        let url = self.resource_url(&self.default_base_path, "Patient")?;

        let bundle = self
            .http
            .get(url)
            .query(&[
                ("identifier", format!("{MBI_SYSTEM}|{mbi}")),
                ("_elements", "id".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<Bundle>()
            .await?;

        bundle
            .entry
            .iter()
            .filter_map(|e| e.resource.as_ref())
            .find_map(|r| r.get("id").and_then(|id| id.as_str()))
            .map(str::to_string)
            .ok_or_else(|| Error::upstream("No upstream patient found for MBI"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> FhirClient {
        FhirClient::new(FhirClientConfig {
            host: "https://fhir.example.gov".to_string(),
            default_base_path: "/v2/fhir".to_string(),
            timeout_secs: 30,
        })
        .unwrap()
    }

    #[test]
    fn rejects_invalid_host() {
        let result = FhirClient::new(FhirClientConfig {
            host: "not a url".to_string(),
            default_base_path: "/v2/fhir".to_string(),
            timeout_secs: 30,
        });
        assert!(result.is_err());
    }

    #[test]
    fn resource_url_joins_base_path() {
        let client = test_client();
        let url = client.resource_url("/v1/fhir", "Coverage").unwrap();
        assert_eq!(url.as_str(), "https://fhir.example.gov/v1/fhir/Coverage");
    }
}
