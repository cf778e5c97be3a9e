use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, FromRequest, Request},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tcc::{BarrierError, BranchOp, TraceContext};

use crate::{HEADER_BRANCH_ID, HEADER_GID, HEADER_OP, HEADER_TRACEPARENT};

/// A Try, Confirm or Cancel call received by a participant.
#[derive(Debug, Clone)]
pub struct BranchCall<T> {
    pub gid: String,
    pub branch_id: String,
    pub op: BranchOp,
    pub trace: Option<TraceContext>,
    pub payload: T,
}

#[async_trait]
impl<S, T> FromRequest<S> for BranchCall<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = BranchRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let headers = req.headers().clone();
        let body = Bytes::from_request(req, state).await?;

        let gid = header(&headers, HEADER_GID)?;
        let branch_id = header(&headers, HEADER_BRANCH_ID)?;
        let op = header(&headers, HEADER_OP)?;
        let op = op.parse().map_err(|_| BranchRejection::InvalidHeader {
            name: HEADER_OP,
            value: op.to_owned(),
        })?;

        let trace = headers
            .get(HEADER_TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .and_then(TraceContext::from_traceparent);

        let payload = serde_json::from_slice(&body)?;

        Ok(Self {
            gid,
            branch_id,
            op,
            trace,
            payload,
        })
    }
}

fn header(headers: &HeaderMap, name: &'static str) -> Result<String, BranchRejection> {
    let value = headers
        .get(name)
        .ok_or(BranchRejection::MissingHeader(name))?;

    value
        .to_str()
        .map(|v| v.to_owned())
        .map_err(|_| BranchRejection::InvalidHeader {
            name,
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
}

#[derive(thiserror::Error, Debug)]
pub enum BranchRejection {
    #[error("missing header `{0}`")]
    MissingHeader(&'static str),

    #[error("invalid header `{name}`: `{value}`")]
    InvalidHeader { name: &'static str, value: String },

    #[error("{0}")]
    Body(#[from] BytesRejection),

    #[error("payload `{0}`")]
    Payload(#[from] serde_json::Error),
}

impl IntoResponse for BranchRejection {
    fn into_response(self) -> Response {
        match self {
            BranchRejection::Body(rejection) => rejection.into_response(),
            rejection => (StatusCode::BAD_REQUEST, rejection.to_string()).into_response(),
        }
    }
}

/// Answer of a branch endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchResponse {
    Success,
    Failure(String),
    Ongoing,
}

impl IntoResponse for BranchResponse {
    fn into_response(self) -> Response {
        match self {
            BranchResponse::Success => {
                (StatusCode::OK, Json(json!({"result": "SUCCESS"}))).into_response()
            }
            BranchResponse::Failure(message) => (
                StatusCode::CONFLICT,
                Json(json!({"result": "FAILURE", "message": message})),
            )
                .into_response(),
            BranchResponse::Ongoing => {
                (StatusCode::TOO_EARLY, Json(json!({"result": "ONGOING"}))).into_response()
            }
        }
    }
}

impl<T> From<Result<Option<T>, BarrierError>> for BranchResponse {
    fn from(value: Result<Option<T>, BarrierError>) -> Self {
        match value {
            Ok(_) => BranchResponse::Success,
            Err(BarrierError::Busy { .. }) => BranchResponse::Ongoing,
            Err(BarrierError::Handler(e)) => BranchResponse::Failure(format!("{e:#}")),
            Err(e) => BranchResponse::Failure(e.to_string()),
        }
    }
}

/// Unexpected participant failure, answered with a 500 so the coordinator retries.
#[derive(Debug)]
pub struct BranchError(anyhow::Error);

impl IntoResponse for BranchError {
    fn into_response(self) -> Response {
        tracing::error!("branch handler '{:#}'", self.0);

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Something went wrong: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for BranchError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type BranchResult<T> = Result<T, BranchError>;
