//! Asynchronous client for the relay's agent-facing API.

use reqwest::{Client, StatusCode};
use thiserror::Error;

use runnel_proto::{
    CommandReport, PendingCommand, RegisterMachineRequest, RegisterMachineResponse, MACHINE_HEADER,
};

#[derive(Clone)]
pub struct RelayClient {
    http: Client,
    base_url: String,
    machine_id: String,
    secret: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
}

impl ClientError {
    /// Whether retrying the same request later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(_) => true,
            ClientError::UnexpectedStatus { status, .. } => status.is_server_error(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another worker won the race; expected contention, not an error.
    AlreadyClaimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Accepted,
    /// The command reached a terminal state server-side (watchdog timeout);
    /// the result is discarded and must not be retried.
    Gone,
    /// The relay does not consider this machine the claimant.
    Rejected,
}

impl RelayClient {
    pub fn new(
        base_url: impl Into<String>,
        machine_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            machine_id: machine_id.into(),
            secret: secret.into(),
        }
    }

    /// One-time machine registration; the only unauthenticated call.
    pub async fn register(
        base_url: &str,
        name: &str,
    ) -> Result<RegisterMachineResponse, ClientError> {
        let url = format!("{base_url}/machines/register");
        let res = Client::new()
            .post(url)
            .json(&RegisterMachineRequest {
                name: name.to_string(),
            })
            .send()
            .await?;
        Self::expect_json(res).await
    }

    pub async fn pending(&self) -> Result<Vec<PendingCommand>, ClientError> {
        let url = format!("{}/commands/pending", self.base_url);
        let res = self.authed(self.http.get(url)).send().await?;
        Self::expect_json(res).await
    }

    pub async fn claim(&self, command_id: i64) -> Result<ClaimOutcome, ClientError> {
        let url = format!("{}/commands/{command_id}/claim", self.base_url);
        let res = self.authed(self.http.post(url)).send().await?;
        match res.status() {
            StatusCode::OK => Ok(ClaimOutcome::Claimed),
            StatusCode::CONFLICT => Ok(ClaimOutcome::AlreadyClaimed),
            status => Err(Self::unexpected(status, res).await),
        }
    }

    pub async fn report(
        &self,
        command_id: i64,
        report: &CommandReport,
    ) -> Result<ReportOutcome, ClientError> {
        let url = format!("{}/commands/{command_id}/result", self.base_url);
        let res = self.authed(self.http.post(url)).json(report).send().await?;
        match res.status() {
            StatusCode::OK => Ok(ReportOutcome::Accepted),
            StatusCode::GONE => Ok(ReportOutcome::Gone),
            StatusCode::FORBIDDEN => Ok(ReportOutcome::Rejected),
            status => Err(Self::unexpected(status, res).await),
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.secret)
            .header(MACHINE_HEADER, &self.machine_id)
    }

    async fn expect_json<T>(res: reqwest::Response) -> Result<T, ClientError>
    where
        T: serde::de::DeserializeOwned,
    {
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            Err(Self::unexpected(status, res).await)
        }
    }

    async fn unexpected(status: StatusCode, res: reqwest::Response) -> ClientError {
        let body = res.text().await.unwrap_or_default();
        ClientError::UnexpectedStatus { status, body }
    }
}
