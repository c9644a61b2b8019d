//! S3 backup store driven through the `aws` CLI.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;

use super::{BackupError, BackupObject, BackupResult, BackupStore};

/// S3 bucket accessed with `aws s3api` / `aws s3`.
#[derive(Debug, Clone)]
pub struct AwsCliBackupStore {
    binary: String,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<ListedObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
    #[serde(default)]
    size: u64,
    last_modified: Option<String>,
}

/// Parse the JSON printed by `aws s3api list-objects-v2 --output json`.
///
/// The CLI prints nothing at all when the prefix is empty.
pub(crate) fn parse_list_objects(stdout: &str) -> BackupResult<Vec<BackupObject>> {
    if stdout.trim().is_empty() {
        return Ok(vec![]);
    }

    let parsed: ListObjectsOutput =
        serde_json::from_str(stdout).map_err(|e| BackupError::Parse(e.to_string()))?;

    Ok(parsed
        .contents
        .into_iter()
        .map(|obj| {
            let modified = obj
                .last_modified
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            let object = BackupObject::new(obj.key, obj.size);
            match modified {
                Some(dt) => object.with_modified(dt),
                None => object,
            }
        })
        .collect())
}

impl AwsCliBackupStore {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint_url: Option<String>,
    ) -> Self {
        Self {
            binary: "aws".to_string(),
            bucket: bucket.into(),
            region: region.into(),
            endpoint_url,
        }
    }

    /// Use a different CLI binary (e.g. a wrapper script).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec!["--region".to_string(), self.region.clone()];
        if let Some(ref url) = self.endpoint_url {
            args.push("--endpoint-url".to_string());
            args.push(url.clone());
        }
        args
    }

    async fn run(&self, command: &str, args: Vec<String>) -> BackupResult<String> {
        let output = Command::new(&self.binary)
            .args(&args)
            .args(self.common_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackupError::Backend(format!("{}: {}", command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("NoSuchKey") || stderr.contains("(404)") {
                return Err(BackupError::NotFound(stderr.trim().to_string()));
            }
            return Err(BackupError::Backend(format!(
                "{}: {}",
                command,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl BackupStore for AwsCliBackupStore {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn list(&self, prefix: &str) -> BackupResult<Vec<BackupObject>> {
        let args = vec![
            "s3api".to_string(),
            "list-objects-v2".to_string(),
            "--bucket".to_string(),
            self.bucket.clone(),
            "--prefix".to_string(),
            prefix.to_string(),
            "--delimiter".to_string(),
            "/".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        let stdout = self.run("list-objects-v2", args).await?;
        parse_list_objects(&stdout)
    }

    async fn copy(&self, src: &str, dst: &str) -> BackupResult<()> {
        let args = vec![
            "s3".to_string(),
            "cp".to_string(),
            "--only-show-errors".to_string(),
            format!("s3://{}/{}", self.bucket, src),
            format!("s3://{}/{}", self.bucket, dst),
        ];
        self.run("s3 cp", args).await?;
        log::debug!("Copied s3://{}/{} to {}", self.bucket, src, dst);
        Ok(())
    }
}
