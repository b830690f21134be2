//! The plain request/response half of the operation protocol.
//!
//! Long-running tasks are started (and cancelled) over ordinary HTTP; the
//! push channel only reports on them. A successful start means the backend
//! accepted the task, not that it ran; a cancel response acknowledges receipt
//! of the abort request, not completion of the abort.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct StartAccepted {
    pub operation_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelAck {
    pub acknowledged: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    operation_id: &'a str,
}

#[derive(Clone)]
pub struct OpsClient {
    http: reqwest::Client,
    base_url: Url,
}

impl OpsClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    /// Ask the backend to start a task. The response arrives when the request
    /// is accepted; progress comes over the channel.
    pub async fn start_operation<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<StartAccepted> {
        let url = self.base_url.join(path)?;
        let response = self.http.post(url).json(body).send().await?;
        Self::decode(response).await
    }

    /// Start a task whose request carries file uploads, e.g. a certificate
    /// bundle or an OTA package.
    pub async fn start_operation_multipart(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
    ) -> Result<StartAccepted> {
        let url = self.base_url.join(path)?;
        let response = self.http.post(url).multipart(form).send().await?;
        Self::decode(response).await
    }

    /// Best-effort abort of an in-flight operation. Callers must not treat a
    /// positive acknowledgment as the operation being cancelled; only a
    /// server-pushed terminal event confirms that.
    pub async fn cancel_operation(&self, path: &str, operation_id: &str) -> Result<CancelAck> {
        let url = self.base_url.join(path)?;
        let response = self
            .http
            .post(url)
            .json(&CancelRequest { operation_id })
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

impl std::fmt::Debug for OpsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}
