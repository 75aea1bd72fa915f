//! MyData REST API client.
//!
//! Async HTTP client using `reqwest` with `ApiKey` authentication.

use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, LOCATION};
use tracing::debug;

use crate::types::{FileRecord, ListResponse, NewFileRecord};
use crate::{MetadataError, MetadataFuture, MetadataService};

const FILE_RECORDS: &str = "/api/v1/mydata_dataset_file/";

/// [`MetadataService`] backed by the MyData REST API.
pub struct HttpMetadataService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpMetadataService {
    /// Creates a client for `base_url` authenticating as `username`.
    pub fn new(
        base_url: &str,
        username: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, MetadataError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("ApiKey {username}:{api_key}"))
                .map_err(|_| MetadataError::InvalidKey)?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn find(
        &self,
        container: &str,
        filename: &str,
        directory: &str,
    ) -> Result<Vec<FileRecord>, MetadataError> {
        let url = format!("{}{FILE_RECORDS}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("format", "json"),
                ("dataset__id", container),
                ("filename", filename),
                ("directory", directory),
            ])
            .send()
            .await?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MetadataError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.bytes().await?;
        let list: ListResponse<FileRecord> = serde_json::from_slice(&body)?;
        if list.meta.total_count != list.objects.len() as u64 {
            debug!(
                container,
                filename,
                total = list.meta.total_count,
                returned = list.objects.len(),
                "lookup result was paged"
            );
        }
        Ok(list.objects)
    }

    async fn create(&self, record: &NewFileRecord) -> Result<String, MetadataError> {
        let url = format!("{}{FILE_RECORDS}", self.base_url);
        let resp = self.http.post(&url).json(record).send().await?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MetadataError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?;

        if !body.is_empty() {
            let value: serde_json::Value = serde_json::from_slice(&body)?;
            if let Some(id) = record_id(&value) {
                return Ok(id);
            }
        }
        location
            .as_deref()
            .and_then(id_from_location)
            .ok_or_else(|| MetadataError::Api {
                status: status.as_u16(),
                body: "response carried no record id".into(),
            })
    }
}

impl MetadataService for HttpMetadataService {
    fn lookup<'a>(
        &'a self,
        container: &'a str,
        filename: &'a str,
        directory: &'a str,
    ) -> MetadataFuture<'a, Vec<FileRecord>> {
        Box::pin(self.find(container, filename, directory))
    }

    fn create_file_record<'a>(&'a self, record: &'a NewFileRecord) -> MetadataFuture<'a, String> {
        Box::pin(self.create(record))
    }
}

/// Extracts `id` from a created-record body (number or string).
fn record_id(value: &serde_json::Value) -> Option<String> {
    match value.get("id")? {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Last path segment of a `Location` such as `/api/v1/mydata_dataset_file/42/`.
fn id_from_location(location: &str) -> Option<String> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
