//! Object Store Adapter. Talks S3 wire protocol to a MinIO deployment:
//! path-style addressing, static credentials, optional presign rewriting
//! through a public gateway host.

use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::Settings;
use crate::domain::buckets;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("local i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    endpoint_url: String,
    public_url: Option<String>,
}

impl ObjectStore {
    pub fn new(settings: &Settings) -> Self {
        let endpoint_url = settings.s3_endpoint_url();
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&endpoint_url)
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new(
                settings.minio_access_key.clone(),
                settings.minio_secret_key.clone(),
                None,
                None,
                "static",
            ))
            .force_path_style(true)
            .build();
        ObjectStore {
            client: Client::from_conf(config),
            endpoint_url,
            public_url: settings.minio_public_url.clone(),
        }
    }

    /// Idempotently create the fixed bucket set.
    pub async fn ensure_buckets(&self) -> Result<(), StorageError> {
        for bucket in buckets::ALL {
            if self.client.head_bucket().bucket(bucket).send().await.is_ok() {
                continue;
            }
            match self.client.create_bucket().bucket(bucket).send().await {
                Ok(_) => info!(bucket, "created bucket"),
                Err(err) => {
                    let service = err.into_service_error();
                    if !service.is_bucket_already_owned_by_you()
                        && !service.is_bucket_already_exists()
                    {
                        return Err(StorageError::Unavailable(service.to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Streamed upload of a local file.
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|err| StorageError::Unavailable(err.into_service_error().to_string()))?;
        Ok(())
    }

    /// Streamed download into a local file.
    pub async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let mut body = self.open(bucket, key).await?;
        let mut file = tokio::fs::File::create(local_path).await?;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Open an object as a byte stream (used by the download endpoint).
    pub async fn open(&self, bucket: &str, key: &str) -> Result<ByteStream, StorageError> {
        match self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(object) => Ok(object.body),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    Err(StorageError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    })
                } else {
                    Err(StorageError::Unavailable(service.to_string()))
                }
            }
        }
    }

    /// Idempotent delete. S3 reports success for absent keys, so any error
    /// here is real unavailability.
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        if let Err(err) = self
            .client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            let service = err.into_service_error();
            warn!(bucket, key, error = %service, "delete_object failed");
            return Err(StorageError::Unavailable(service.to_string()));
        }
        Ok(())
    }

    pub async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|err| StorageError::Unavailable(err.into_service_error().to_string()))?;
        Ok(self.rewrite_for_public(request.uri()))
    }

    pub async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|err| StorageError::Unavailable(err.into_service_error().to_string()))?;
        Ok(self.rewrite_for_public(request.uri()))
    }

    fn rewrite_for_public(&self, url: &str) -> String {
        match &self.public_url {
            Some(public) => rewrite_gateway(url, &self.endpoint_url, public),
            None => url.to_string(),
        }
    }
}

/// Swap the internal endpoint prefix for the public gateway prefix so the
/// signed URL is reachable from outside the deployment network.
fn rewrite_gateway(url: &str, endpoint: &str, public: &str) -> String {
    url.replacen(
        endpoint.trim_end_matches('/'),
        public.trim_end_matches('/'),
        1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_rewrite_replaces_only_the_endpoint_prefix() {
        let url = "http://minio:9000/raw/owner/abc_cat.png?X-Amz-Signature=deadbeef";
        assert_eq!(
            rewrite_gateway(url, "http://minio:9000", "http://localhost/minio"),
            "http://localhost/minio/raw/owner/abc_cat.png?X-Amz-Signature=deadbeef"
        );
    }

    #[test]
    fn gateway_rewrite_tolerates_trailing_slashes() {
        let url = "http://minio:9000/raw/k";
        assert_eq!(
            rewrite_gateway(url, "http://minio:9000/", "http://localhost/minio/"),
            "http://localhost/minio/raw/k"
        );
    }
}
