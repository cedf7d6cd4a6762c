use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::storage::StorageProvider;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDefinition {
    pub file_id: String,
    pub source_name: Option<String>,
    pub size: Option<u64>,
    /// Uploaded-byte deltas for inventory files are forwarded to the progress sink.
    #[serde(default)]
    pub inventory: bool,
}

impl FileDefinition {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            source_name: None,
            size: None,
            inventory: false,
        }
    }

    pub fn display_name(&self) -> &str {
        self.source_name.as_deref().unwrap_or("a stream")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadLocation {
    pub url: String,
    pub provider: StorageProvider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertPartParams {
    pub session_id: String,
    pub file_id: String,
    pub part_number: u32,
    pub byte_count: u64,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertFinishedParams {
    pub session_id: String,
    pub file_id: String,
    pub total_parts: u64,
    pub total_bytes: u64,
}

/// Control-plane calls made around each chunk transfer.
pub trait TransferApi: Send + Sync {
    fn get_upload_location<'a>(
        &'a self,
        session_id: &'a str,
        file: &'a FileDefinition,
        part_number: u32,
    ) -> Pin<Box<dyn Future<Output = Result<UploadLocation>> + Send + 'a>>;

    fn assert_part_uploaded<'a>(
        &'a self,
        params: AssertPartParams,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn assert_upload_finished<'a>(
        &'a self,
        params: AssertFinishedParams,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Hands out `mem://` locations and records every assertion it receives.
#[derive(Debug)]
pub struct InMemoryTransferApi {
    provider: StorageProvider,
    pub location_requests: AtomicUsize,
    parts: Mutex<Vec<AssertPartParams>>,
    finished: Mutex<Vec<AssertFinishedParams>>,
}

impl Default for InMemoryTransferApi {
    fn default() -> Self {
        Self::new(StorageProvider::Memory)
    }
}

impl InMemoryTransferApi {
    pub fn new(provider: StorageProvider) -> Self {
        Self {
            provider,
            location_requests: AtomicUsize::new(0),
            parts: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    pub fn location_request_count(&self) -> usize {
        self.location_requests.load(Ordering::Relaxed)
    }

    pub async fn asserted_parts(&self) -> Vec<AssertPartParams> {
        self.parts.lock().await.clone()
    }

    pub async fn finished_uploads(&self) -> Vec<AssertFinishedParams> {
        self.finished.lock().await.clone()
    }
}

impl TransferApi for InMemoryTransferApi {
    fn get_upload_location<'a>(
        &'a self,
        session_id: &'a str,
        file: &'a FileDefinition,
        part_number: u32,
    ) -> Pin<Box<dyn Future<Output = Result<UploadLocation>> + Send + 'a>> {
        Box::pin(async move {
            self.location_requests.fetch_add(1, Ordering::Relaxed);
            Ok(UploadLocation {
                url: format!("mem://{session_id}/{}/{part_number}", file.file_id),
                provider: self.provider,
            })
        })
    }

    fn assert_part_uploaded<'a>(
        &'a self,
        params: AssertPartParams,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.parts.lock().await.push(params);
            Ok(())
        })
    }

    fn assert_upload_finished<'a>(
        &'a self,
        params: AssertFinishedParams,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let parts = self.parts.lock().await;
            let confirmed = parts
                .iter()
                .filter(|p| p.session_id == params.session_id && p.file_id == params.file_id)
                .count() as u64;
            if confirmed != params.total_parts {
                return Err(Error::Remote {
                    message: format!(
                        "upload finished with {} parts but {confirmed} were confirmed",
                        params.total_parts
                    ),
                });
            }
            drop(parts);
            self.finished.lock().await.push(params);
            Ok(())
        })
    }
}

/// JSON-over-HTTP control plane:
///
/// - `POST {base}/sessions/{session}/files/{file}/parts/{part}/location` returns an
///   [`UploadLocation`]
/// - `POST {base}/sessions/{session}/parts` confirms one part
/// - `POST {base}/sessions/{session}/finish` closes the file
pub struct HttpTransferApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransferApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post<B: Serialize + Sync>(&self, url: String, body: &B) -> Result<String> {
        let res = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Remote {
                message: format!("request failed: {e}"),
            })?;

        let status = res.status();
        let text = res.text().await.map_err(|e| Error::Remote {
            message: format!("read response failed: {e}"),
        })?;
        if !status.is_success() {
            return Err(Error::Remote {
                message: format!("http {status}: {text}"),
            });
        }
        Ok(text)
    }
}

impl TransferApi for HttpTransferApi {
    fn get_upload_location<'a>(
        &'a self,
        session_id: &'a str,
        file: &'a FileDefinition,
        part_number: u32,
    ) -> Pin<Box<dyn Future<Output = Result<UploadLocation>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url(&format!(
                "sessions/{session_id}/files/{}/parts/{part_number}/location",
                file.file_id
            ));
            let body = self.post(url, file).await?;
            serde_json::from_str(&body).map_err(|e| Error::Remote {
                message: format!("invalid json: {e}; body={body}"),
            })
        })
    }

    fn assert_part_uploaded<'a>(
        &'a self,
        params: AssertPartParams,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url(&format!("sessions/{}/parts", params.session_id));
            self.post(url, &params).await.map(|_| ())
        })
    }

    fn assert_upload_finished<'a>(
        &'a self,
        params: AssertFinishedParams,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url(&format!("sessions/{}/finish", params.session_id));
            self.post(url, &params).await.map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finish_is_rejected_until_all_parts_are_confirmed() {
        let api = InMemoryTransferApi::default();
        let file = FileDefinition::new("f_1");
        let location = api.get_upload_location("s_1", &file, 1).await.unwrap();
        assert_eq!(location.url, "mem://s_1/f_1/1");
        assert_eq!(location.provider, StorageProvider::Memory);

        let finished = AssertFinishedParams {
            session_id: "s_1".to_string(),
            file_id: "f_1".to_string(),
            total_parts: 1,
            total_bytes: 3,
        };
        assert!(api.assert_upload_finished(finished.clone()).await.is_err());

        api.assert_part_uploaded(AssertPartParams {
            session_id: "s_1".to_string(),
            file_id: "f_1".to_string(),
            part_number: 1,
            byte_count: 3,
            digest: "d".to_string(),
        })
        .await
        .unwrap();
        api.assert_upload_finished(finished).await.unwrap();
        assert_eq!(api.finished_uploads().await.len(), 1);
    }

    #[test]
    fn unnamed_files_are_reported_as_streams() {
        let mut file = FileDefinition::new("f_1");
        assert_eq!(file.display_name(), "a stream");
        file.source_name = Some("photo.jpg".to_string());
        assert_eq!(file.display_name(), "photo.jpg");
    }

    #[test]
    fn http_api_trims_trailing_slashes() {
        let api = HttpTransferApi::new("https://transfer.example.com/v1/");
        assert_eq!(
            api.url("sessions/s_1/finish"),
            "https://transfer.example.com/v1/sessions/s_1/finish"
        );
    }

    #[test]
    fn upload_location_wire_format_is_camel_case() {
        let location: UploadLocation =
            serde_json::from_str(r#"{"url":"https://put.example.com/p/1","provider":"http_put"}"#)
                .unwrap();
        assert_eq!(location.provider, StorageProvider::HttpPut);

        let params = serde_json::to_value(AssertPartParams {
            session_id: "s_1".to_string(),
            file_id: "f_1".to_string(),
            part_number: 3,
            byte_count: 10,
            digest: "d".to_string(),
        })
        .unwrap();
        assert_eq!(params["partNumber"], 3);
        assert_eq!(params["byteCount"], 10);
    }
}
