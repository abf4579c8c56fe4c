//! Client for a running bridge, used by `whisper-bridge recognize`.

use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use crate::correlator::Recognition;
use crate::error::{Error, Result};
use crate::server::error::ApiErrorBody;

pub const DEFAULT_URL: &str = "http://127.0.0.1:8801";

pub struct BridgeClient {
    client: Client,
    base_url: String,
}

impl BridgeClient {
    /// `timeout` should exceed the bridge's request timeout, or slow
    /// recognitions are cut off on the client side first.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn recognize(&self, file_path: &str) -> Result<Recognition> {
        let response = self
            .client
            .post(format!("{}/recognize", self.base_url))
            .json(&json!({ "filePath": file_path }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await?;
        Err(match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(error) => Error::Remote {
                status: status.as_u16(),
                code: error.code,
                message: error.error,
            },
            Err(_) => Error::Remote {
                status: status.as_u16(),
                code: "UNKNOWN".to_string(),
                message: body,
            },
        })
    }
}
