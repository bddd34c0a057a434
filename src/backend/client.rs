use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;
use crate::session::SessionProvider;
use super::errors::{BackendError, Result};
use super::types::{BackendJobId, HistoryPage, HistoryQuery, StatusReport, SubmitAck, UploadFile};
use super::Backend;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_ERROR_MESSAGE: &str = "An error occurred";

/// reqwest 实现的分析服务客户端
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    endpoint: Url,
    session: Arc<dyn SessionProvider>,
}

impl HttpBackend {
    pub fn new(endpoint: &str, session: Arc<dyn SessionProvider>) -> Result<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Self::with_client(client, endpoint, session)
    }

    pub fn with_client(client: Client, endpoint: &str, session: Arc<dyn SessionProvider>) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint)?;
        // Url::join 会替换最后一段路径，除非以 '/' 结尾
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        Ok(Self {
            client,
            endpoint,
            session,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.endpoint.join(path.trim_start_matches('/'))?)
    }

    pub(crate) fn status_url(&self, backend_job_id: BackendJobId) -> Result<Url> {
        self.url(&format!("receipts/{}", backend_job_id))
    }

    pub(crate) fn history_url(&self, query: &HistoryQuery) -> Result<Url> {
        let mut url = self.url("users/me/uploads")?;
        let pairs = query.to_pairs();
        if !pairs.is_empty() {
            let mut serializer = url.query_pairs_mut();
            for (key, value) in pairs {
                serializer.append_pair(key, &value);
            }
        }
        Ok(url)
    }

    fn authorize(builder: RequestBuilder, token: Option<&str>) -> Result<RequestBuilder> {
        match token {
            Some(token) => {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|err| BackendError::InvalidRequest(err.to_string()))?;
                Ok(builder.header(AUTHORIZATION, value))
            }
            None => Ok(builder),
        }
    }

    /// Send with the current token; on a 401 refresh once and retry once
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> Result<RequestBuilder>,
    {
        let token = self.session.access_token();
        let response = Self::authorize(build()?, token.as_deref())?.send().await?;

        if response.status() != StatusCode::UNAUTHORIZED || token.is_none() {
            return Ok(response);
        }

        tracing::debug!("Access token rejected, refreshing session");
        match self.session.refresh().await {
            Some(new_token) => {
                let retry = Self::authorize(build()?, Some(&new_token))?.send().await?;
                Ok(retry)
            }
            None => Err(BackendError::unauthorized("Session refresh failed")),
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return serde_json::from_value(serde_json::Value::Null)
                .map_err(|err| BackendError::DecodeError(err.to_string()));
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("application/json"))
            .unwrap_or(false);

        if !is_json {
            if status == StatusCode::UNAUTHORIZED {
                return Err(BackendError::unauthorized(DEFAULT_ERROR_MESSAGE));
            }
            if !status.is_success() {
                return Err(BackendError::server_error(status.as_u16(), DEFAULT_ERROR_MESSAGE));
            }
            return Err(BackendError::DecodeError(format!(
                "Expected a JSON response, got status {}",
                status
            )));
        }

        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(error_from_body(status, &body));
        }

        serde_json::from_value(body).map_err(|err| BackendError::DecodeError(err.to_string()))
    }
}

/// Turn an `{ "error": "...", "details": ... }` body into a categorized error
pub(crate) fn error_from_body(status: StatusCode, body: &serde_json::Value) -> BackendError {
    let message = body
        .get("error")
        .or_else(|| body.get("message"))
        .and_then(|value| value.as_str())
        .unwrap_or(DEFAULT_ERROR_MESSAGE)
        .to_string();

    if status == StatusCode::UNAUTHORIZED {
        BackendError::unauthorized(message)
    } else {
        BackendError::server_error(status.as_u16(), message)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn submit(&self, file: &UploadFile) -> Result<SubmitAck> {
        if file.is_empty() {
            return Err(BackendError::InvalidRequest(format!("File '{}' is empty", file.name)));
        }

        let url = self.url("image/split-and-analyze")?;
        let response = self
            .send(|| {
                let mut part = Part::stream_with_length(Body::from(file.data.clone()), file.len() as u64)
                    .file_name(file.name.clone());
                if let Some(content_type) = &file.content_type {
                    part = part
                        .mime_str(content_type)
                        .map_err(|err| BackendError::InvalidRequest(err.to_string()))?;
                }
                let form = Form::new().part("file", part);
                Ok(self.client.post(url.clone()).multipart(form))
            })
            .await?;

        Self::decode(response).await
    }

    async fn poll_status(&self, backend_job_id: BackendJobId) -> Result<StatusReport> {
        let url = self.status_url(backend_job_id)?;
        let response = self.send(|| Ok(self.client.get(url.clone()))).await?;
        Self::decode(response).await
    }

    async fn list_history(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let url = self.history_url(query)?;
        let response = self.send(|| Ok(self.client.get(url.clone()))).await?;
        Self::decode(response).await
    }
}
