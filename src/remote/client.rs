// ABOUTME: HTTP client for the remote sync API
// ABOUTME: Bearer auth with exactly one refresh-and-retry after a 401

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::models::{self, MetaRequest, PageRequest, Record};
use super::RecordSource;
use crate::auth::TokenManager;
use crate::config::ApiConfig;
use crate::cursor::DateWindow;
use crate::error::{Result, SyncError};

pub struct SyncApiClient {
    client: Client,
    base_url: String,
    tokens: Arc<TokenManager>,
}

impl SyncApiClient {
    pub fn new(config: &ApiConfig, tokens: Arc<TokenManager>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::http(&config.sync_base_url, e))?;

        Ok(Self {
            client,
            base_url: config.sync_base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    pub fn endpoint_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table.trim_start_matches('/'))
    }

    /// POST `payload` to `{base}/{table}` and return the JSON body.
    pub async fn post<P: Serialize + Sync>(&self, table: &str, payload: &P) -> Result<Value> {
        let url = self.endpoint_url(table);
        let response = self.send_authenticated(&url, payload).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Http {
                url,
                message: format!(
                    "status {}: {}",
                    status,
                    crate::utils::truncate_chars(&body, 200)
                ),
                source: None,
            });
        }

        response.json::<Value>().await.map_err(|e| SyncError::Http {
            url,
            message: format!("invalid JSON body: {}", e),
            source: Some(e),
        })
    }

    /// Raw call used by the fetch smoke test: status code plus body, whatever it is.
    pub async fn probe(&self, table: &str, payload: &Value) -> Result<(u16, Value)> {
        let url = self.endpoint_url(table);
        let response = self.send_authenticated(&url, payload).await?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| SyncError::http(&url, e))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok((status, body))
    }

    async fn send_authenticated<P: Serialize + Sync>(
        &self,
        url: &str,
        payload: &P,
    ) -> Result<Response> {
        let token = self.tokens.get_token().await?;
        let response = self.send(url, &token, payload).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!("Token rejected by {}, refreshing and retrying once", url);
        let token = self.tokens.refresh_token().await?;
        let response = self.send(url, &token, payload).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Auth(format!(
                "{} rejected a freshly issued token",
                url
            )));
        }
        Ok(response)
    }

    async fn send<P: Serialize + Sync>(
        &self,
        url: &str,
        token: &str,
        payload: &P,
    ) -> Result<Response> {
        tracing::debug!("POST {}", url);
        self.client
            .post(url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(|e| SyncError::http(url, e))
    }
}

#[async_trait]
impl RecordSource for SyncApiClient {
    async fn fetch_total(&self, table: &str, window: &DateWindow) -> Result<u64> {
        let body = self.post(table, &MetaRequest::new(window)).await?;
        models::parse_meta_total(table, &body)
    }

    async fn fetch_page(
        &self,
        table: &str,
        window: &DateWindow,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Record>> {
        let body = self
            .post(table, &PageRequest::new(window, page, page_size))
            .await?;
        models::parse_page_records(table, &body)
    }

    async fn fetch_dump(&self, table: &str) -> Result<Vec<Record>> {
        let body = self.post(table, &json!({})).await?;
        models::parse_dump_records(table, &body)
    }
}
