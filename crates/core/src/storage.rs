use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::remote::UploadLocation;
use crate::source::Chunk;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageProvider {
    HttpPut,
    Memory,
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageProvider::HttpPut => "http.put",
            StorageProvider::Memory => "test.mem",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl StorageOutcome {
    pub fn ok(status_code: Option<u16>) -> Self {
        Self {
            success: true,
            status_code,
            error_message: None,
        }
    }

    pub fn failed(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            error_message: Some(message.into()),
        }
    }
}

/// Provider-specific transport for one chunk. Transport errors are reported as a failed
/// outcome, never as a panic or an `Err`, so the caller can account for every attempt.
pub trait StorageStrategy: Send + Sync {
    fn provider(&self) -> StorageProvider;

    fn upload<'a>(
        &'a self,
        chunk: &'a Chunk,
        location: &'a UploadLocation,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = StorageOutcome> + Send + 'a>>;
}

#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<StorageProvider, Arc<dyn StorageStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: Arc<dyn StorageStrategy>) -> Self {
        self.register(strategy);
        self
    }

    pub fn register(&mut self, strategy: Arc<dyn StorageStrategy>) {
        self.strategies.insert(strategy.provider(), strategy);
    }

    pub fn get(&self, provider: StorageProvider) -> Result<Arc<dyn StorageStrategy>> {
        self.strategies
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("no storage strategy registered for provider {provider}"),
            })
    }
}

/// PUTs the encrypted chunk to a pre-signed location.
pub struct HttpPutStorage {
    client: reqwest::Client,
}

impl HttpPutStorage {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpPutStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageStrategy for HttpPutStorage {
    fn provider(&self) -> StorageProvider {
        StorageProvider::HttpPut
    }

    fn upload<'a>(
        &'a self,
        chunk: &'a Chunk,
        location: &'a UploadLocation,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = StorageOutcome> + Send + 'a>> {
        Box::pin(async move {
            let request = self
                .client
                .put(&location.url)
                .header("content-type", "application/octet-stream")
                .header("x-part-number", chunk.part_number.to_string())
                .header("x-content-blake3", chunk.digest.as_str())
                .body(chunk.data.clone())
                .send();

            let res = tokio::select! {
                res = request => res,
                _ = cancel.cancelled() => {
                    return StorageOutcome::failed(None, "upload cancelled");
                }
            };

            let res = match res {
                Ok(res) => res,
                Err(e) => {
                    let status = e.status().map(|s| s.as_u16());
                    return StorageOutcome::failed(status, format!("request failed: {e}"));
                }
            };

            let status = res.status();
            if status.is_success() {
                return StorageOutcome::ok(Some(status.as_u16()));
            }

            let body = tokio::select! {
                body = res.text() => body.unwrap_or_default(),
                _ = cancel.cancelled() => String::new(),
            };
            StorageOutcome::failed(Some(status.as_u16()), format!("http {status}: {body}"))
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    pub uploaded: AtomicUsize,
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.inner.lock().await.get(url).cloned()
    }

    pub async fn object_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploaded.load(Ordering::Relaxed)
    }
}

impl StorageStrategy for InMemoryStorage {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Memory
    }

    fn upload<'a>(
        &'a self,
        chunk: &'a Chunk,
        location: &'a UploadLocation,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = StorageOutcome> + Send + 'a>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return StorageOutcome::failed(None, "upload cancelled");
            }
            self.inner
                .lock()
                .await
                .insert(location.url.clone(), chunk.data.clone());
            self.uploaded.fetch_add(1, Ordering::Relaxed);
            StorageOutcome::ok(Some(201))
        })
    }
}
