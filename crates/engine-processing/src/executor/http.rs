use crate::{
    error::ExecutorError,
    executor::{
        CursorExecutor, CursorRequest, CursorResponse, UnitExecutor, UnitRequest, UnitResponse,
    },
};
use async_trait::async_trait;
use model::cursor::Cursor;
use reqwest::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, time::Duration};
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Wire body of a unit invocation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnitPayload<'a> {
    job_id: &'a str,
    dimensions: BTreeMap<&'a str, &'a str>,
    params: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a UnitRequest> for UnitPayload<'a> {
    fn from(req: &'a UnitRequest) -> Self {
        UnitPayload {
            job_id: &req.job_id,
            dimensions: req
                .unit
                .coords()
                .iter()
                .map(|c| (c.dimension.as_str(), c.value.as_str()))
                .collect(),
            params: &req.params,
        }
    }
}

/// Wire body of a cursor call. A `null` cursor means start of stream.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CursorPayload<'a> {
    job_id: &'a str,
    cursor: Option<&'a Cursor>,
    batch_size: u32,
    params: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a CursorRequest> for CursorPayload<'a> {
    fn from(req: &'a CursorRequest) -> Self {
        CursorPayload {
            job_id: &req.job_id,
            cursor: req.cursor.as_ref(),
            batch_size: req.batch_size,
            params: &req.params,
        }
    }
}

#[derive(Clone)]
struct Endpoint {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl Endpoint {
    fn new(
        url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;

        Ok(Endpoint {
            client,
            url: url.into(),
            auth_token,
        })
    }

    async fn post<B, R>(&self, body: &B) -> Result<R, ExecutorError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(url = %self.url, status = status.as_u16(), "Executor returned error status");
            return Err(status_error(status, body));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ExecutorError::Decode(e.to_string()))
    }
}

fn status_error(status: StatusCode, body: String) -> ExecutorError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ExecutorError::Rejected(body),
        _ => ExecutorError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

/// Invokes a unit executor exposed as a JSON-over-HTTP endpoint.
#[derive(Clone)]
pub struct HttpUnitExecutor {
    endpoint: Endpoint,
}

impl HttpUnitExecutor {
    pub fn new(
        url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        Ok(HttpUnitExecutor {
            endpoint: Endpoint::new(url, auth_token, timeout)?,
        })
    }
}

#[async_trait]
impl UnitExecutor for HttpUnitExecutor {
    async fn execute(&self, request: UnitRequest) -> Result<UnitResponse, ExecutorError> {
        self.endpoint.post(&UnitPayload::from(&request)).await
    }
}

#[derive(Clone)]
pub struct HttpCursorExecutor {
    endpoint: Endpoint,
}

impl HttpCursorExecutor {
    pub fn new(
        url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        Ok(HttpCursorExecutor {
            endpoint: Endpoint::new(url, auth_token, timeout)?,
        })
    }
}

#[async_trait]
impl CursorExecutor for HttpCursorExecutor {
    async fn fetch(&self, request: CursorRequest) -> Result<CursorResponse, ExecutorError> {
        self.endpoint.post(&CursorPayload::from(&request)).await
    }
}
