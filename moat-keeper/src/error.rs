use std::sync::Arc;

use moat_limit::Reason;
use moat_limit::RetryError;
use moat_limit::SharedError;
use moat_limit::retry::Exhaustion;

use crate::resource::ResourceId;

/// Errors produced by the moat pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MoatError {
    /// A moat rejected the call.
    ///
    /// When the `axum` feature is enabled, rate rejections convert to
    /// `429 Too Many Requests` and the others to `503 Service Unavailable`.
    #[error("{resource} not permitted: {reason}")]
    NotPermitted {
        resource: ResourceId,
        reason: Reason,
    },

    /// Every retry attempt failed, or the last failure was not retryable.
    #[error("retry for {resource} exhausted after {attempts} attempt(s): {exhaustion}")]
    RetryExhausted {
        resource: ResourceId,
        attempts: u32,
        exhaustion: Exhaustion,
        #[source]
        cause: SharedError,
    },

    /// A retry backoff wait was cut short.
    #[error("retry for {resource} interrupted after {attempts} attempt(s)")]
    Interrupted {
        resource: ResourceId,
        attempts: u32,
        #[source]
        cause: SharedError,
    },

    /// The protected call failed on its own.
    #[error(transparent)]
    Biz(SharedError),

    /// A handle was misused: ended twice, or ended without having started.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The fallback failed, or is configured to fail.
    #[error("fallback failed: {0}")]
    Fallback(#[source] SharedError),
}

impl MoatError {
    pub(crate) fn from_retry(resource: &ResourceId, err: RetryError) -> Self {
        match err {
            RetryError::Exhausted {
                attempts,
                exhaustion,
                cause,
            } => Self::RetryExhausted {
                resource: resource.clone(),
                attempts,
                exhaustion,
                cause: Arc::from(cause),
            },
            RetryError::Interrupted { attempts, cause } => Self::Interrupted {
                resource: resource.clone(),
                attempts,
                cause: Arc::from(cause),
            },
        }
    }

    pub fn reason(&self) -> Option<&Reason> {
        match self {
            Self::NotPermitted { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// The business failure underneath, if any.
    pub fn biz_cause(&self) -> Option<&SharedError> {
        match self {
            Self::RetryExhausted { cause, .. } | Self::Interrupted { cause, .. } | Self::Biz(cause) => {
                Some(cause)
            }
            _ => None,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for MoatError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, headers) = match &self {
            Self::NotPermitted {
                reason: Reason::RateOverflow(metrics),
                ..
            } => {
                let secs = metrics.retry_after.as_secs().max(1);
                let val = axum::http::HeaderValue::from(secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Some((axum::http::header::RETRY_AFTER, val)),
                )
            }
            Self::NotPermitted { .. } => (StatusCode::SERVICE_UNAVAILABLE, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let mut response = (status, self.to_string()).into_response();
        if let Some((name, value)) = headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}
