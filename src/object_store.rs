use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::config::ObjectStoreConfig;
use crate::error::{EngineError, EngineResult};

/// The object store contract the archival subsystem depends on. Kept small
/// and stream-oriented so a non-S3 backend can stand in during tests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>, content_type: &str) -> EngineResult<()>;
    async fn get_object(&self, bucket: &str, key: &str) -> EngineResult<Vec<u8>>;
    async fn bucket_exists(&self, bucket: &str) -> EngineResult<bool>;
}

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS config plus any endpoint override
    /// (e.g. a MinIO instance used in local development).
    pub async fn from_config(config: &ObjectStoreConfig) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(Client::from_conf(builder.build()))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>, content_type: &str) -> EngineResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("s3 put_object {bucket}/{key} failed: {e}")))?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> EngineResult<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("s3 get_object {bucket}/{key} failed: {e}")))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| EngineError::Transient(format!("s3 get_object {bucket}/{key} body read failed: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn bucket_exists(&self, bucket: &str) -> EngineResult<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(EngineError::Transient(format!("s3 head_bucket {bucket} failed: {e}")))
                }
            }
        }
    }
}

/// In-memory stand-in for tests and local development without a real S3/MinIO endpoint.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: dashmap::DashMap<(String, String), Vec<u8>>,
    buckets: dashmap::DashSet<String>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(bucket: &str) -> Self {
        let store = Self::default();
        store.buckets.insert(bucket.to_string());
        store
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>, _content_type: &str) -> EngineResult<()> {
        self.buckets.insert(bucket.to_string());
        self.objects.insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> EngineResult<Vec<u8>> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.clone())
            .ok_or_else(|| EngineError::NotFound(format!("object {bucket}/{key} not found")))
    }

    async fn bucket_exists(&self, bucket: &str) -> EngineResult<bool> {
        Ok(self.buckets.contains(bucket))
    }
}
