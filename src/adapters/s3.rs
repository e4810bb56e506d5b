use anyhow::{Result as AnyResult, ensure};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::config::StorageConfig;
use crate::core::storage::{CompletedPart, ObjectStore, PartReader, UploadOptions};
use crate::error::{Result, TransferError};

/// S3-compatible multipart store (AWS, OSS, MinIO, R2).
///
/// Each part body is buffered before sending so the request carries an
/// exact content length; memory use is bounded by `concurrency * part_size`.
pub struct S3Store {
    client: Client,
    bucket: String,
    public_url_base: Option<String>,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>, public_url_base: Option<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            public_url_base,
        }
    }

    /// Static keys from config when both are set, otherwise the default
    /// AWS provider chain (environment, profile, instance metadata).
    pub async fn from_config(config: &StorageConfig) -> AnyResult<Self> {
        ensure!(!config.bucket.is_empty(), "storage.bucket is not set");
        let region = Region::new(config.region.clone());

        let mut builder = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => S3ConfigBuilder::new()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "podvault-config",
                ))
                .region(region),
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                S3ConfigBuilder::from(&shared)
            }
        };

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint_url(endpoint));
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self::new(
            Client::from_conf(builder.build()),
            config.bucket.clone(),
            config.public_url_base.clone(),
        ))
    }
}

/// Bare hosts (`oss-cn-hangzhou.aliyuncs.com`) get an https scheme.
fn endpoint_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

fn storage_err<E>(operation: &str, err: E) -> TransferError
where
    E: std::error::Error,
{
    TransferError::storage(operation, DisplayErrorContext(err))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn initiate_multipart_upload(&self, key: &str, options: &UploadOptions) -> Result<String> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key);
        if let Some(expires_at) = options.expires_at {
            request = request.expires(AwsDateTime::from_secs(expires_at.timestamp()));
        }
        let output = request
            .send()
            .await
            .map_err(|e| storage_err("initiate", e))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| TransferError::storage("initiate", "response had no upload id"))?;
        debug!(key, upload_id, workers = options.workers, "Multipart upload initiated");
        Ok(upload_id.to_string())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: PartReader,
        length: u64,
    ) -> Result<CompletedPart> {
        let what = format!("part {part_number} of {key}");
        let mut buf = Vec::with_capacity(length as usize);
        body.take(length)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| TransferError::transfer(&what, e))?;
        if buf.len() as u64 != length {
            return Err(TransferError::transfer(
                &what,
                format!("source yielded {} of {length} bytes", buf.len()),
            ));
        }
        let part = i32::try_from(part_number)
            .map_err(|_| TransferError::InvalidArgument(format!("part number {part_number}")))?;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part)
            .content_length(length as i64)
            .body(ByteStream::from(buf))
            .send()
            .await
            .map_err(|e| TransferError::transfer(&what, DisplayErrorContext(e)))?;

        let etag = output
            .e_tag()
            .ok_or_else(|| TransferError::transfer(&what, "response had no ETag"))?;
        Ok(CompletedPart {
            part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let parts = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| storage_err("complete", e))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| storage_err("abort", e))?;
        Ok(())
    }

    fn object_url(&self, key: &str) -> String {
        object_url(self.public_url_base.as_deref(), &self.bucket, key)
    }
}

fn object_url(public_url_base: Option<&str>, bucket: &str, key: &str) -> String {
    match public_url_base {
        Some(base) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            urlencoding::encode(key)
        ),
        None => format!("s3://{bucket}/{key}"),
    }
}
