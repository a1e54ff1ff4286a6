//! Client for the remote job coordination service.
//!
//! Every call is a JSON `POST` to `{base}/api/v1/webhook/{endpoint}`
//! authenticated with an `X-API-Token` header. Responses share one
//! envelope, `{"code": 1, "message": "...", "data": {...}}`, where any code
//! other than `1` is a rejection.
//!
//! Calls are blocking and bounded by a fixed timeout. Whether a failure is
//! fatal is up to the caller: progress and caching calls are best-effort,
//! fetching the job and its credentials is not.

use crate::ids::IdentifierStore;
use crate::portal::TwoFactorSource;
use crate::progress::Progress;
use crate::{Error, Result};
use plist::Dictionary;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

/// Connection settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_token: SecretString,
    pub job_id: String,
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_token: SecretString,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            api_token,
            job_id: job_id.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/api/v1/webhook/{}", self.base_url, endpoint)
    }
}

/// Response envelope shared by all endpoints.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.code == 1
    }

    /// Payload of a successful response.
    pub fn into_data(self, endpoint: &str) -> Result<Option<T>> {
        if !self.is_success() {
            return Err(Error::Remote {
                endpoint: endpoint.to_string(),
                message: self.message.unwrap_or_else(|| format!("code {}", self.code)),
            });
        }
        Ok(self.data)
    }
}

/// Everything the service knows about a job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInfo {
    #[serde(default)]
    pub job: JobData,
    #[serde(default)]
    pub account: AccountData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobData {
    #[serde(default)]
    pub job_type: String,
    /// Download URL of the unsigned archive.
    #[serde(default)]
    pub input_path: String,
    #[serde(default)]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub bundle_name: Option<String>,
}

/// Developer account the job signs for.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub team_id: String,
}

/// Certificate cached for an account; `certificate_data` is base64.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateInfo {
    pub certificate_data: String,
    #[serde(default)]
    pub team_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadTarget {
    upload_url: String,
    file_key: String,
}

#[derive(Debug, Serialize)]
struct ProgressReport<'a> {
    job_id: &'a str,
    progress: u8,
    state: u8,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct CapabilitiesReport<'a> {
    account_id: &'a str,
    bundle_id: &'a str,
    capabilities: &'a BTreeSet<String>,
    entitlements: &'a Dictionary,
    job_id: &'a str,
}

/// Blocking client for the coordination service.
#[derive(Debug)]
pub struct RemoteClient {
    config: RemoteConfig,
    http: reqwest::blocking::Client,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(Error::Config("remote service URL is empty".into()));
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, http })
    }

    fn call<T: DeserializeOwned>(&self, endpoint: &str, body: &Value) -> Result<Option<T>> {
        tracing::debug!(endpoint, "remote call");
        let response = self
            .http
            .post(self.config.endpoint_url(endpoint))
            .header("X-API-Token", self.config.api_token.expose_secret())
            .json(body)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(Error::Remote {
                endpoint: endpoint.to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), message),
            });
        }
        let envelope: Envelope<T> = response.json()?;
        envelope.into_data(endpoint)
    }

    /// Fetches the job description. Fatal on any failure.
    pub fn fetch_job(&self) -> Result<JobInfo> {
        let endpoint = "job/start";
        self.call(endpoint, &json!({ "job_id": self.config.job_id }))?
            .ok_or_else(|| Error::Remote {
                endpoint: endpoint.into(),
                message: "no job data".into(),
            })
    }

    pub fn report_progress(&self, percent: u8, message: &str) -> Result<()> {
        let report = ProgressReport {
            job_id: &self.config.job_id,
            progress: percent,
            state: 1,
            message,
        };
        self.call::<Value>("job/progress", &serde_json::to_value(report)?)?;
        Ok(())
    }

    pub fn certificate(&self, account_id: &str) -> Result<Option<CertificateInfo>> {
        self.call("certificate/get", &json!({ "account_id": account_id }))
    }

    pub fn store_certificate(&self, account_id: &str, team_id: &str, data: &str) -> Result<()> {
        self.call::<Value>(
            "certificate/store",
            &json!({
                "account_id": account_id,
                "team_id": team_id,
                "certificate_data": data,
                "job_id": self.config.job_id,
            }),
        )?;
        Ok(())
    }

    /// Records the capabilities an uploaded app uses, for later analysis.
    pub fn store_capabilities(
        &self,
        account_id: &str,
        bundle_id: &str,
        capabilities: &BTreeSet<String>,
        entitlements: &Dictionary,
    ) -> Result<()> {
        let report = CapabilitiesReport {
            account_id,
            bundle_id,
            capabilities,
            entitlements,
            job_id: &self.config.job_id,
        };
        self.call::<Value>("app/capabilities", &serde_json::to_value(report)?)?;
        tracing::info!(bundle_id, count = capabilities.len(), "stored app capabilities");
        Ok(())
    }

    pub fn bundle_mapping(&self, original: &str) -> Result<Option<String>> {
        let data: Option<Value> = self.call(
            "bundle/get",
            &json!({
                "job_id": self.config.job_id,
                "original_bundle_id": original,
                "app_type": "main",
            }),
        )?;
        Ok(data
            .as_ref()
            .and_then(|d| d.get("mapped_bundle_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string))
    }

    pub fn store_bundle_mapping(&self, original: &str, mapped: &str) -> Result<()> {
        self.call::<Value>(
            "bundle/store",
            &json!({
                "job_id": self.config.job_id,
                "original_bundle_id": original,
                "mapped_bundle_id": mapped,
                "app_type": "main",
            }),
        )?;
        Ok(())
    }

    pub fn complete_job(&self, output_path: &str, file_size: u64) -> Result<()> {
        self.call::<Value>(
            "job/complete",
            &json!({
                "job_id": self.config.job_id,
                "output_path": output_path,
                "file_size": file_size,
                "status": "completed",
                "message": "Job completed successfully",
            }),
        )?;
        Ok(())
    }

    pub fn fail_job(&self, message: &str, details: &str) -> Result<()> {
        self.call::<Value>(
            "job/fail",
            &json!({
                "job_id": self.config.job_id,
                "message": message,
                "error_details": details,
            }),
        )?;
        Ok(())
    }

    /// Downloads `url` to `dest`, returning the number of bytes written.
    pub fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .http
            .get(url)
            .timeout(TRANSFER_TIMEOUT)
            .send()?
            .error_for_status()?;
        let mut file = std::fs::File::create(dest)?;
        let written = response.copy_to(&mut file)?;
        file.flush()?;
        tracing::info!(url, bytes = written, "downloaded");
        Ok(written)
    }

    /// Uploads a file in three steps: request a pre-signed destination,
    /// transfer the bytes, confirm. Returns the stored file key.
    pub fn upload(&self, path: &Path) -> Result<String> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "signed.ipa".into());
        let file_size = std::fs::metadata(path)?.len();

        let endpoint = "upload/request";
        let target: UploadTarget = self
            .call(
                endpoint,
                &json!({
                    "job_id": self.config.job_id,
                    "file_name": file_name,
                    "file_size": file_size,
                    "content_type": "application/octet-stream",
                }),
            )?
            .ok_or_else(|| Error::Remote {
                endpoint: endpoint.into(),
                message: "no upload destination".into(),
            })?;

        let file = std::fs::File::open(path)?;
        self.http
            .put(&target.upload_url)
            .timeout(TRANSFER_TIMEOUT)
            .header("Content-Type", "application/octet-stream")
            .body(reqwest::blocking::Body::sized(file, file_size))
            .send()?
            .error_for_status()?;
        tracing::info!(file_key = %target.file_key, bytes = file_size, "uploaded");

        self.call::<Value>(
            "upload/confirm",
            &json!({
                "job_id": self.config.job_id,
                "file_key": target.file_key,
                "file_size": file_size,
            }),
        )?;
        Ok(target.file_key)
    }
}

impl Progress for RemoteClient {
    fn report(&self, percent: u8, message: &str) {
        match self.report_progress(percent, message) {
            Ok(()) => tracing::info!(percent, message, "progress reported"),
            Err(e) => tracing::warn!(error = %e, percent, "failed to report progress"),
        }
    }
}

impl IdentifierStore for RemoteClient {
    fn lookup(&self, original: &str) -> Result<Option<String>> {
        self.bundle_mapping(original)
    }

    fn store(&self, original: &str, assigned: &str) -> Result<()> {
        self.store_bundle_mapping(original, assigned)
    }
}

impl TwoFactorSource for RemoteClient {
    fn two_factor_code(&self) -> Result<Option<String>> {
        let data: Option<Value> = self.call("job/2fa", &json!({ "job_id": self.config.job_id }))?;
        Ok(data
            .as_ref()
            .and_then(|d| d.get("two_factor_code"))
            .and_then(Value::as_str)
            .filter(|code| !code.is_empty())
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RemoteConfig {
        RemoteConfig::new(" https://jobs.example.com/ ", SecretString::from("t0ken".to_string()), "42")
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            config().endpoint_url("job/progress"),
            "https://jobs.example.com/api/v1/webhook/job/progress"
        );
        assert_eq!(config().timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_envelope_success() {
        let env: Envelope<JobInfo> = serde_json::from_str(
            r#"{"code":1,"message":"ok","data":{
                "job":{"job_type":"sign","input_path":"https://s3/x.ipa"},
                "account":{"id":"7","email":"dev@example.com","password":"pw","team_id":"TEAM123456"}
            }}"#,
        )
        .unwrap();
        let info = env.into_data("job/start").unwrap().unwrap();
        assert_eq!(info.job.input_path, "https://s3/x.ipa");
        assert_eq!(info.account.team_id, "TEAM123456");
        assert_eq!(info.account.id.as_deref(), Some("7"));
    }

    #[test]
    fn test_envelope_rejection() {
        let env: Envelope<Value> =
            serde_json::from_str(r#"{"code":0,"message":"job not found"}"#).unwrap();
        let err = env.into_data("job/start").unwrap_err();
        match err {
            Error::Remote { endpoint, message } => {
                assert_eq!(endpoint, "job/start");
                assert_eq!(message, "job not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_envelope_without_data() {
        let env: Envelope<CertificateInfo> = serde_json::from_str(r#"{"code":1}"#).unwrap();
        assert!(env.into_data("certificate/get").unwrap().is_none());
    }

    #[test]
    fn test_progress_body() {
        let body = serde_json::to_value(ProgressReport {
            job_id: "42",
            progress: 55,
            state: 1,
            message: "Signing component 1/3",
        })
        .unwrap();
        assert_eq!(
            body,
            json!({"job_id":"42","progress":55,"state":1,"message":"Signing component 1/3"})
        );
    }

    #[test]
    fn test_capabilities_body() {
        let capabilities: BTreeSet<String> = ["app_groups".to_string()].into();
        let mut entitlements = Dictionary::new();
        entitlements.insert(
            "com.apple.security.application-groups".into(),
            plist::Value::Array(vec!["group.com.orig.App".into()]),
        );
        entitlements.insert("get-task-allow".into(), plist::Value::Boolean(false));

        let body = serde_json::to_value(CapabilitiesReport {
            account_id: "7",
            bundle_id: "com.orig.App",
            capabilities: &capabilities,
            entitlements: &entitlements,
            job_id: "42",
        })
        .unwrap();
        assert_eq!(
            body,
            json!({
                "account_id": "7",
                "bundle_id": "com.orig.App",
                "capabilities": ["app_groups"],
                "entitlements": {
                    "com.apple.security.application-groups": ["group.com.orig.App"],
                    "get-task-allow": false,
                },
                "job_id": "42",
            })
        );
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let cfg = RemoteConfig::new("", SecretString::from("t".to_string()), "1");
        assert!(RemoteClient::new(cfg).unwrap_err().is_configuration());
    }
}
