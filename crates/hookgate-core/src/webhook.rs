//! Webhook delivery.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{multipart, redirect};
use tracing::debug;

use crate::{errors::Error, Result};

/// One delivery attempt: form fields `jsonData` and `token`, plus an optional file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookRequest {
    pub url: String,
    pub token: String,
    pub json_data: String,
    /// Attachment saved on disk; switches the request to the multipart variant.
    pub file: Option<PathBuf>,
}

/// Outbound webhook port. A single attempt per call; failures are reported, not retried.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn deliver(&self, req: WebhookRequest) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct WebhookClientOptions {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub accept_invalid_certs: bool,
}

impl Default for WebhookClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_redirects: 15,
            accept_invalid_certs: false,
        }
    }
}

/// reqwest-backed sender shared by every session.
#[derive(Clone, Debug)]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new(opts: &WebhookClientOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(opts.timeout)
            .redirect(redirect::Policy::limited(opts.max_redirects))
            .danger_accept_invalid_certs(opts.accept_invalid_certs)
            .build()
            .map_err(|e| Error::Config(format!("webhook client build failed: {e}")))?;
        Ok(Self { http })
    }

    async fn file_form(req: &WebhookRequest, path: &Path) -> Result<multipart::Form> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("attachment")
            .to_string();
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime.essence_str())
            .map_err(|e| Error::Delivery(format!("webhook multipart error: {e}")))?;
        Ok(multipart::Form::new()
            .text("jsonData", req.json_data.clone())
            .text("token", req.token.clone())
            .part("file", part))
    }
}

#[async_trait]
impl WebhookSender for WebhookClient {
    async fn deliver(&self, req: WebhookRequest) -> Result<()> {
        let builder = self.http.post(&req.url);
        let builder = match &req.file {
            Some(path) => builder.multipart(Self::file_form(&req, path).await?),
            None => builder.form(&[
                ("jsonData", req.json_data.as_str()),
                ("token", req.token.as_str()),
            ]),
        };

        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("webhook request error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Delivery(format!(
                "webhook returned {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        debug!(url = %req.url, %status, with_file = req.file.is_some(), "webhook delivered");
        Ok(())
    }
}
