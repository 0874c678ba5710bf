//! HTTP client for the engine's session API.

use std::path::Path;
use std::time::Duration;

use nbhost_protocol::{
    AddCellRequest, AddCellResponse, CellId, CellResult, EngineErrorBody, OpenSessionRequest,
    OpenSessionResponse, RunCodeRequest, SessionId, routes,
};
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{HostError, HostResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    base_url: String,
    base: Url,
}

impl EngineClient {
    pub fn new(base_url: impl Into<String>) -> HostResult<Self> {
        let base_url = base_url.into();
        let base = routes::base(&base_url).map_err(HostError::Config)?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|err| HostError::HttpClient(err.to_string()))?;
        Ok(Self {
            http,
            base_url,
            base,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the engine answers at all; error statuses count.
    pub async fn ping(&self) -> bool {
        self.http.get(&self.base_url).send().await.is_ok()
    }

    pub async fn open_session(&self, path: &Path, content: Option<&str>) -> HostResult<SessionId> {
        let body = OpenSessionRequest {
            path: path.to_path_buf(),
            content: content.map(str::to_string),
        };
        let response = self
            .send("open session", self.http.post(routes::sessions(&self.base)).json(&body))
            .await?;
        let opened: OpenSessionResponse = decode("open session", response).await?;
        debug!(path = %path.display(), session = %opened.session_id, "session opened");
        Ok(opened.session_id)
    }

    /// A session the engine no longer knows counts as closed.
    pub async fn close_session(&self, session_id: &str) -> HostResult<()> {
        let url = routes::session(&self.base, session_id);
        self.send_allow_gone("close session", self.http.delete(url)).await
    }

    pub async fn add_cell(&self, session_id: &str, index: usize, code: &str) -> HostResult<CellId> {
        let body = AddCellRequest {
            index,
            code: code.to_string(),
        };
        let url = routes::cells(&self.base, session_id);
        let response = self.send("add cell", self.http.post(url).json(&body)).await?;
        let added: AddCellResponse = decode("add cell", response).await?;
        Ok(added.cell_id)
    }

    pub async fn run_cell(&self, session_id: &str, cell_id: &str, code: &str) -> HostResult<CellResult> {
        let url = routes::run_cell(&self.base, session_id, cell_id);
        let response = self
            .send("execute cell", self.http.post(url).json(&run_body(code)))
            .await?;
        decode("execute cell", response).await
    }

    pub async fn delete_cell(&self, session_id: &str, cell_id: &str) -> HostResult<()> {
        let url = routes::cell(&self.base, session_id, cell_id);
        self.send_allow_gone("delete cell", self.http.delete(url)).await
    }

    pub async fn run_ephemeral(&self, session_id: &str, code: &str) -> HostResult<CellResult> {
        let url = routes::ephemeral(&self.base, session_id);
        let response = self
            .send("execute ephemeral code", self.http.post(url).json(&run_body(code)))
            .await?;
        decode("execute ephemeral code", response).await
    }

    async fn send(&self, operation: &str, request: reqwest::RequestBuilder) -> HostResult<Response> {
        let response = transport(operation, request).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(engine_error(operation, response).await)
        }
    }

    async fn send_allow_gone(&self, operation: &str, request: reqwest::RequestBuilder) -> HostResult<()> {
        let response = transport(operation, request).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            debug!(operation, "target already gone");
            Ok(())
        } else {
            Err(engine_error(operation, response).await)
        }
    }
}

async fn transport(operation: &str, request: reqwest::RequestBuilder) -> HostResult<Response> {
    request
        .send()
        .await
        .map_err(|err| HostError::session_op(operation, err.to_string()))
}

fn run_body(code: &str) -> RunCodeRequest {
    RunCodeRequest {
        code: code.to_string(),
    }
}

async fn engine_error(operation: &str, response: Response) -> HostError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<EngineErrorBody>(&text)
        .map(|body| body.message)
        .unwrap_or(text);
    if message.is_empty() {
        HostError::session_op(operation, status.to_string())
    } else {
        HostError::session_op(operation, format!("{status}: {message}"))
    }
}

async fn decode<T: DeserializeOwned>(operation: &str, response: Response) -> HostResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|err| HostError::session_op(operation, format!("invalid engine response: {err}")))
}
