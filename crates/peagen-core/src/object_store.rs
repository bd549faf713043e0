//! Object storage sink for task artifacts.
//!
//! The core never stores artifact bytes; it only interprets an [`ArtifactUri`]
//! enough to decide whether it is a `file://`/`s3://`/`git+`-style reference.
//! [`HttpObjectStore`] is a thin PUT/GET client against an S3-compatible
//! HTTP endpoint (e.g. MinIO), used by worker-side handlers that need to
//! stage artifacts; the gateway itself never calls it.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;

use crate::error::Result;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_bytes(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    async fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct HttpObjectStore {
    endpoint: Url,
    client: Arc<reqwest::Client>,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: endpoint.parse().context("parse object store endpoint URL")?,
            client: Arc::new(reqwest::Client::new()),
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> anyhow::Result<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        format!("{base}/{bucket}/{key}").parse().context("build object URL")
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_bytes(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let url = self.object_url(bucket, key)?;
        let resp = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .context("PUT object")?;
        resp.error_for_status().context("PUT object status")?;
        Ok(())
    }

    async fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(bucket, key)?;
        let resp = self.client.get(url).send().await.context("GET object")?;
        let resp = resp.error_for_status().context("GET object status")?;
        Ok(resp.bytes().await.context("GET body bytes")?.to_vec())
    }
}

/// Parse `s3://bucket/key` into `(bucket, key)`. Other artifact URI schemes
/// (`git+...#sha@path`, `file://...`) are passed through opaquely by
/// handlers; the core does not parse them.
pub fn parse_s3_uri(uri: &str) -> anyhow::Result<(String, String)> {
    let rest = uri.strip_prefix("s3://").ok_or_else(|| anyhow!("artifact uri must start with s3://"))?;
    let (bucket, key) = rest.split_once('/').ok_or_else(|| anyhow!("s3 uri missing key"))?;
    Ok((bucket.to_string(), key.to_string()))
}
