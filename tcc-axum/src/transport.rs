use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use tcc::{BranchRequest, CallError, Transport};

use crate::{HEADER_BRANCH_ID, HEADER_GID, HEADER_OP, HEADER_TRACEPARENT};

/// Calls branch endpoints with `POST {endpoint}` and the payload as body.
///
/// The coordinator bounds every call with its own timeout, a client
/// timeout is only needed when the transport is used on its own.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, request: BranchRequest) -> Result<(), CallError> {
        let mut builder = self
            .client
            .post(&request.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_GID, &request.gid)
            .header(HEADER_BRANCH_ID, &request.branch_id)
            .header(HEADER_OP, request.op.to_string());

        if let Some(trace_parent) = &request.trace_parent {
            builder = builder.header(HEADER_TRACEPARENT, trace_parent);
        }

        let resp = builder
            .body(request.payload)
            .send()
            .await
            .map_err(|e| CallError::Unreachable(e.to_string()))?;

        let status = resp.status();

        if status.is_success() {
            return Ok(());
        }

        match status {
            StatusCode::CONFLICT => {
                let message = resp.text().await.unwrap_or_default();
                Err(CallError::Rejected(message))
            }
            StatusCode::TOO_EARLY => Err(CallError::Ongoing),
            status => Err(CallError::Unreachable(format!("unexpected status {status}"))),
        }
    }
}
