use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::debug;

use super::{StagingError, StagingStore};

/// Staging store backed by S3 (or any S3-compatible store like minio, via an
/// endpoint override on the client config).
pub struct S3StagingStore {
    client: S3Client,
    bucket: String,
}

impl S3StagingStore {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Build a client from the ambient AWS environment, with an optional
    /// endpoint override for S3-compatible stores.
    pub async fn from_env(region: &str, endpoint: Option<&str>, bucket: String) -> Self {
        let mut config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_owned()));

        if let Some(endpoint) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint);
        }

        let aws_config = config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if endpoint.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self::new(S3Client::from_conf(s3_config_builder.build()), bucket)
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl StagingStore for S3StagingStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<String, StagingError> {
        debug!("staging {} bytes at {}", data.len(), self.location(key));
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StagingError::OperationFailed(format!("put {key}: {e}")))?;

        Ok(self.location(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StagingError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StagingError::OperationFailed(format!("delete {key}: {e}")))?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StagingError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StagingError::OperationFailed(format!("list {prefix}: {e}")))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_owned());
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_owned()),
                None => break,
            }
        }
        Ok(keys)
    }
}
