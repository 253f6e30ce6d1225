//! Registry credential resolution.
//!
//! The only private registries this resolver knows are Amazon ECR ones
//! (`<account>.dkr.ecr.<region>.amazonaws.com`). Credentials come from the
//! external `docker-credential-ecr-login` helper, which receives the
//! registry host on stdin and prints `{Username, Secret}` JSON. When the
//! environment carries no AWS credentials at all, the resolver reports
//! "no credentials" and pulls proceed anonymously.

use crate::error::{DockerError, Result};
use crate::RegistryAuth;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Credential helper binary invoked for ECR registries.
const ECR_HELPER: &str = "docker-credential-ecr-login";

/// AWS environment variables forwarded to the credential helper.
const AWS_ENV_VARS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_REGION",
    "AWS_DEFAULT_REGION",
    "AWS_PROFILE",
    "AWS_CONFIG_FILE",
    "AWS_SHARED_CREDENTIALS_FILE",
    "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI",
    "AWS_CONTAINER_CREDENTIALS_FULL_URI",
    "AWS_ROLE_ARN",
    "AWS_ROLE_SESSION_NAME",
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_CA_BUNDLE",
    "AWS_METADATA_SERVICE_TIMEOUT",
    "AWS_METADATA_SERVICE_NUM_ATTEMPTS",
    "AWS_STS_REGIONAL_ENDPOINTS",
    "AWS_SDK_LOAD_CONFIG",
];

/// Per-registry credential lookup consumed by the materializer.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolves credentials for a registry host, or `None` when the pull
    /// should proceed anonymously.
    async fn resolve(&self, registry: &str) -> Result<Option<RegistryAuth>>;
}

/// Response shape of `docker-credential-ecr-login get`.
#[derive(Debug, Deserialize)]
struct HelperCredentials {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Resolver for Amazon ECR registries via the external credential helper.
pub struct EcrCredentialResolver {
    pattern: Regex,
}

impl EcrCredentialResolver {
    /// Creates the resolver.
    ///
    /// # Panics
    ///
    /// Panics if the ECR host pattern fails to compile (cannot happen for
    /// the fixed pattern).
    #[must_use]
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"^(\d{12})\.dkr\.ecr\.([^.]+)\.amazonaws\.com(/.*)?$")
                .expect("ECR host pattern"),
        }
    }

    /// Whether a registry host is an ECR registry.
    #[must_use]
    pub fn is_ecr_registry(&self, registry: &str) -> bool {
        self.pattern.is_match(registry)
    }

    /// Extracts the AWS region from an ECR registry host.
    #[must_use]
    pub fn region(&self, registry: &str) -> Option<String> {
        self.pattern
            .captures(registry)
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str().to_string())
    }

    /// Extracts the AWS account id from an ECR registry host.
    #[must_use]
    pub fn account_id(&self, registry: &str) -> Option<String> {
        self.pattern
            .captures(registry)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl Default for EcrCredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialResolver for EcrCredentialResolver {
    async fn resolve(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        if !self.is_ecr_registry(registry) {
            return Ok(None);
        }
        if !has_aws_credentials() {
            info!(registry = %registry, "no AWS credentials detected for ECR registry");
            return Ok(None);
        }

        debug!(
            registry = %registry,
            region = self.region(registry).as_deref().unwrap_or(""),
            account = self.account_id(registry).as_deref().unwrap_or(""),
            "resolving ECR credentials"
        );

        let mut cmd = Command::new(ECR_HELPER);
        cmd.arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();
        for (key, value) in aws_environment() {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| DockerError::Credential(format!("failed to run {ECR_HELPER}: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(registry.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(DockerError::Credential(format!(
                "{ECR_HELPER} failed for {registry}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let creds: HelperCredentials =
            serde_json::from_slice(&output.stdout).map_err(|source| DockerError::Decode {
                source,
                content: String::from_utf8_lossy(&output.stdout).into_owned(),
            })?;

        info!(registry = %registry, username = %creds.username, "obtained ECR credentials");
        Ok(Some(RegistryAuth {
            username: creds.username,
            password: creds.secret,
        }))
    }
}

/// Whether the environment carries anything AWS credentials could come
/// from: static keys, a profile, config files under `$HOME/.aws`, or
/// container credential endpoints.
fn has_aws_credentials() -> bool {
    let env = |key: &str| std::env::var(key).is_ok_and(|v| !v.is_empty());

    if env("AWS_ACCESS_KEY_ID") && env("AWS_SECRET_ACCESS_KEY") {
        return true;
    }
    if env("AWS_PROFILE") {
        return true;
    }
    if let Ok(home) = std::env::var("HOME") {
        let aws_dir = Path::new(&home).join(".aws");
        if aws_dir.join("credentials").exists() || aws_dir.join("config").exists() {
            return true;
        }
    }
    if env("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") || env("AWS_CONTAINER_CREDENTIALS_FULL_URI") {
        return true;
    }
    false
}

/// The allow-listed AWS environment, plus `HOME` so the helper can find
/// credential files.
fn aws_environment() -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for key in AWS_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                vars.push(((*key).to_string(), value));
            }
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            vars.push(("HOME".to_string(), home));
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_ecr_registries() {
        let resolver = EcrCredentialResolver::new();
        let cases = [
            ("123456789012.dkr.ecr.us-west-2.amazonaws.com", true),
            ("123456789012.dkr.ecr.eu-central-1.amazonaws.com/my-repo", true),
            ("docker.io/library/nginx", false),
            ("gcr.io/my-project/my-image", false),
            ("localhost:5000", false),
            ("invalid.dkr.ecr.us-west-2.amazonaws.com", false),
        ];
        for (registry, expected) in cases {
            assert_eq!(
                resolver.is_ecr_registry(registry),
                expected,
                "is_ecr_registry({registry})"
            );
        }
    }

    #[test]
    fn extracts_region() {
        let resolver = EcrCredentialResolver::new();
        assert_eq!(
            resolver.region("123456789012.dkr.ecr.us-west-2.amazonaws.com"),
            Some("us-west-2".to_string())
        );
        assert_eq!(
            resolver.region("123456789012.dkr.ecr.eu-central-1.amazonaws.com"),
            Some("eu-central-1".to_string())
        );
        assert_eq!(resolver.region("docker.io/library/nginx"), None);
    }

    #[test]
    fn extracts_account_id() {
        let resolver = EcrCredentialResolver::new();
        assert_eq!(
            resolver.account_id("123456789012.dkr.ecr.us-west-2.amazonaws.com"),
            Some("123456789012".to_string())
        );
        assert_eq!(
            resolver.account_id("987654321098.dkr.ecr.eu-central-1.amazonaws.com"),
            Some("987654321098".to_string())
        );
        assert_eq!(resolver.account_id("docker.io/library/nginx"), None);
    }

    #[tokio::test]
    async fn non_ecr_registry_resolves_to_anonymous() {
        let resolver = EcrCredentialResolver::new();
        let auth = resolver.resolve("docker.io").await.unwrap();
        assert!(auth.is_none());
    }
}
