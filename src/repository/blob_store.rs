//! 制品存储（不透明键值）

use async_trait::async_trait;
use dashmap::DashMap;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::Region;
use secrecy::ExposeSecret;

use crate::config::StorageConfig;
use crate::error::{AppError, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 写入 JSON 文档，返回存储位置
    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<String>;

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

// ==================== S3 ====================

pub struct S3BlobStore {
    bucket: Box<Bucket>,
    bucket_name: String,
}

impl S3BlobStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => Credentials::new(
                Some(access_key.as_str()),
                Some(secret_key.expose_secret().as_str()),
                None,
                None,
                None,
            ),
            // 回退到环境变量 / 实例角色
            _ => Credentials::default(),
        }
        .map_err(|e| AppError::Config(format!("Failed to construct S3 credentials: {}", e)))?;

        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid S3 region: {}", e)))?,
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| AppError::Config(format!("Failed to create S3 bucket client: {}", e)))?;

        Ok(Self {
            bucket: Box::new(bucket),
            bucket_name: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<String> {
        let body = serde_json::to_vec_pretty(value)?;
        self.bucket
            .put_object_with_content_type(key, &body, "application/json")
            .await
            .map_err(|e| AppError::Storage(format!("Failed to put {}: {}", key, e)))?;

        tracing::debug!(bucket = %self.bucket_name, key, size = body.len(), "Artifact stored");
        Ok(format!("s3://{}/{}", self.bucket_name, key))
    }

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        match self.bucket.get_object(key).await {
            Ok(response) => Ok(Some(serde_json::from_slice(response.bytes())?)),
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => Ok(None),
            Err(e) => Err(AppError::Storage(format!("Failed to get {}: {}", key, e))),
        }
    }
}

// ==================== 内存 ====================

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, serde_json::Value>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<String> {
        self.objects.insert(key.to_string(), value.clone());
        Ok(format!("memory://{}", key))
    }

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.objects.get(key).map(|v| v.value().clone()))
    }
}
