//! Error-to-HTTP response conversion.
//!
//! Route handlers return `Result<T, ApiError>`; each domain error converts
//! into the shared [`tunerflow_common::Error`] plus the status to send.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tunerflow_common::Error;

use crate::live::LiveStreamError;
use crate::streaming::RangeError;
use crate::transcode::TranscodeError;
use crate::tuners::TunerError;

pub struct ApiError {
    status: StatusCode,
    inner: Error,
}

impl ApiError {
    pub fn new(inner: Error) -> Self {
        let status = match &inner {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Io(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, inner }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(Error::not_found(what))
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(Error::invalid_input(msg))
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::new(e)
    }
}

impl From<LiveStreamError> for ApiError {
    fn from(e: LiveStreamError) -> Self {
        match e {
            LiveStreamError::SourceUnavailable(msg) => Self::new(Error::Unavailable(msg)).with_status(StatusCode::BAD_GATEWAY),
            LiveStreamError::SourceBusy(msg) => Self::new(Error::Unavailable(msg)),
            LiveStreamError::InvalidSource(msg) => Self::new(Error::InvalidInput(msg)),
            LiveStreamError::Closed => Self::new(Error::Unavailable("stream closed".into())).with_status(StatusCode::GONE),
            LiveStreamError::NotFound(msg) => Self::new(Error::NotFound(msg)),
            LiveStreamError::Io(e) => Self::new(Error::Io(e)),
        }
    }
}

impl From<TunerError> for ApiError {
    fn from(e: TunerError) -> Self {
        match e {
            TunerError::UnknownTuner(msg) | TunerError::ChannelNotFound(msg) => Self::new(Error::NotFound(msg)),
            TunerError::NoFreeTuner(msg) => Self::new(Error::Unavailable(msg)),
            TunerError::Io(e) => Self::new(Error::Io(e)),
            other => Self::new(Error::Unavailable(other.to_string())).with_status(StatusCode::BAD_GATEWAY),
        }
    }
}

impl From<TranscodeError> for ApiError {
    fn from(e: TranscodeError) -> Self {
        match e {
            TranscodeError::EncoderNotFound(msg) => Self::new(Error::Unavailable(format!("encoder not found: {}", msg))),
            TranscodeError::NotFound(msg) => Self::new(Error::NotFound(msg)),
            TranscodeError::Source(e) => Self::from(e),
            TranscodeError::Spawn(e) | TranscodeError::Io(e) => Self::new(Error::Io(e)),
        }
    }
}

impl From<RangeError> for ApiError {
    fn from(e: RangeError) -> Self {
        let status = e.status();
        let inner = match e {
            RangeError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            RangeError::Io(e) => Error::Io(e),
            other => Error::InvalidInput(other.to_string()),
        };
        Self { status, inner }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.inner, "Server error in API handler");
        }

        // 416 carries no body.
        if self.status == StatusCode::RANGE_NOT_SATISFIABLE {
            return self.status.into_response();
        }

        let code = match &self.inner {
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::Unavailable(_) => "unavailable",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
        };

        let body = json!({
            "error": self.inner.to_string(),
            "code": code,
        });

        (self.status, axum::Json(body)).into_response()
    }
}
