#![forbid(unsafe_code)]

use gondolin_policy::AdmitDecision;

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    /// The secret policy refused to let this request leave the host. The
    /// guest sees a 502; the keep-alive connection survives.
    #[error("request blocked: {reason}")]
    RequestBlocked { reason: String },

    #[error("admission denied for {host}: {decision:?}")]
    AdmissionDenied {
        host: String,
        decision: AdmitDecision,
    },

    #[error("hook rejected request")]
    HookDenied,

    #[error(transparent)]
    Hook(#[from] gondolin_policy::HookError),

    #[error("malformed HTTP request: {0}")]
    BadRequest(&'static str),

    #[error("request head too large")]
    HeadTooLarge,

    #[error("request body too large to buffer")]
    BodyTooLarge,

    #[error("timed out")]
    Timeout,

    #[error("guest closed the connection")]
    GuestClosed,

    #[error("upstream DNS returned no usable address for {0}")]
    NoAddress(String),

    #[error("upstream error: {0}")]
    Upstream(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),
}

impl InterceptError {
    /// Whether the keep-alive connection can continue serving requests
    /// after this failure (the request was fully consumed and a synthetic
    /// response can stand in for it).
    pub fn keeps_connection(&self) -> bool {
        matches!(
            self,
            InterceptError::RequestBlocked { .. }
                | InterceptError::AdmissionDenied { .. }
                | InterceptError::HookDenied
                | InterceptError::Hook(_)
                | InterceptError::NoAddress(_)
                | InterceptError::Upstream(_)
        )
    }
}
