use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};

use crate::config::WorkerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{JobRecord, JobResult, SubmitReceipt};
use crate::worker::SchedulerApi;

/// HTTP client for a remote scheduler.
#[derive(Debug, Clone)]
pub struct HttpSchedulerClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpSchedulerClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        Self::new(
            config.scheduler_url.clone(),
            config.access_token.clone(),
            config.request_timeout,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/api/v1/{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.query(&[("token", token)]),
            None => builder,
        }
    }

    pub async fn submit(&self, payload: Vec<u8>, version: Option<&str>) -> Result<SubmitReceipt> {
        let mut builder = self.request(Method::POST, "study").body(payload);
        if let Some(version) = version {
            builder = builder.query(&[("version", version)]);
        }
        let response = ensure_success(builder.send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn get_result(&self, id: &str) -> Result<JobResult> {
        let response = self
            .request(Method::GET, &format!("result/{}", id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SchedulerError::JobNotFound(id.to_string()));
        }
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SchedulerError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl SchedulerApi for HttpSchedulerClient {
    async fn claim(&self, version: Option<&str>) -> Result<Option<JobRecord>> {
        let mut builder = self.request(Method::GET, "job/next");
        if let Some(version) = version {
            builder = builder.query(&[("version", version)]);
        }
        let response = ensure_success(builder.send().await?).await?;
        let body: serde_json::Value = response.json().await?;

        // An empty object means the queue had nothing for us
        if body.as_object().is_some_and(|o| o.is_empty()) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(body)?))
    }

    async fn report(&self, record: &JobRecord) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("job/{}", record.id))
            .json(record)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}
