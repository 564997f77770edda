use crate::config::ResourceStep;
use crate::errors::*;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use log::info;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Write-only boundary that records newly chosen steps outside the
/// cluster. The reconciler calls it once per reconcile, after the owner
/// update has landed and only when at least one container was promoted.
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn upload_new_steps(
        &self,
        app_name: &str,
        steps: &HashMap<String, ResourceStep>,
    ) -> Result<String>;
}

/// Default store when no backend is configured.
pub struct NoopStepStore;

#[async_trait]
impl StepStore for NoopStepStore {
    async fn upload_new_steps(
        &self,
        app_name: &str,
        steps: &HashMap<String, ResourceStep>,
    ) -> Result<String> {
        info!(
            "noop upload invoked for new steps of {} ({} containers), enable a blob store if needed",
            app_name,
            steps.len()
        );
        Ok(String::new())
    }
}

/// Writes `<app_name>.json` into the configured bucket. The body is the
/// promoted-steps mapping, container name to step.
pub struct S3StepStore {
    client: aws_sdk_s3::Client,
    bucket_name: String,
}

impl S3StepStore {
    pub async fn new(bucket_name: String, endpoint: Option<String>) -> Result<S3StepStore> {
        let base = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base);
        if let Some(endpoint) = endpoint {
            // S3-compatible endpoints (minio and friends) want path-style keys
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Ok(S3StepStore {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket_name,
        })
    }
}

#[async_trait]
impl StepStore for S3StepStore {
    async fn upload_new_steps(
        &self,
        app_name: &str,
        steps: &HashMap<String, ResourceStep>,
    ) -> Result<String> {
        let body = serde_json::to_vec(steps)
            .chain_err(|| format!("error serialising steps for {}", app_name))?;
        let key = format!("{}.json", app_name);

        let put = self
            .client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&key)
            .body(ByteStream::from(body))
            .send();

        match tokio::time::timeout(UPLOAD_TIMEOUT, put).await {
            Err(_) => Err(ErrorKind::ExportTimeout.into()),
            Ok(Err(e)) => Err(Error::with_chain(
                e,
                format!("error uploading steps for {} to {}", app_name, self.bucket_name),
            )),
            Ok(Ok(output)) => Ok(output.e_tag().unwrap_or_default().to_string()),
        }
    }
}

/// STORAGE_TYPE=s3 selects the bucket store; anything else gets the
/// noop. Bucket name and endpoint come from S3_BUCKET and AWS_ENDPOINT.
pub async fn from_env() -> Result<Box<dyn StepStore>> {
    let storage_type = env::var("STORAGE_TYPE").unwrap_or_default();
    info!("initialising step store (storage_type {:?})", storage_type);
    match storage_type.to_lowercase().as_str() {
        "s3" => {
            let bucket_name = env::var("S3_BUCKET").unwrap_or_default();
            if bucket_name.is_empty() {
                bail!("bucket name not set");
            }
            let endpoint = env::var("AWS_ENDPOINT").ok().filter(|e| !e.is_empty());
            Ok(Box::new(S3StepStore::new(bucket_name, endpoint).await?))
        }
        _ => Ok(Box::new(NoopStepStore)),
    }
}
