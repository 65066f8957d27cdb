use std::time::Duration;

/// Errors produced by the floodgate middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// The request was refused by a flow rule.
    ///
    /// `retry_after` carries the refusing controller's back-off hint when
    /// it could compute one. When the `axum` feature is enabled, this
    /// converts to `429 Too Many Requests` with a `Retry-After` header.
    #[error("request blocked by flow control")]
    Blocked {
        /// How long to wait before a retry has a chance, if known.
        retry_after: Option<Duration>,
    },

    /// The request exceeded the configured deadline, which covers waiting
    /// for admission and running the inner service together.
    ///
    /// When the `axum` feature is enabled, this converts to
    /// `408 Request Timeout`.
    #[error("request timed out under flow control")]
    Timeout,
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GateError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, headers) = match self {
            Self::Timeout => (StatusCode::REQUEST_TIMEOUT, self.to_string(), None),
            Self::Blocked { retry_after } => {
                let header = retry_after.map(|wait| {
                    let secs = wait.as_secs().max(1);
                    (
                        axum::http::header::RETRY_AFTER,
                        axum::http::HeaderValue::from(secs),
                    )
                });
                (StatusCode::TOO_MANY_REQUESTS, self.to_string(), header)
            }
        };

        let mut response = (status, msg).into_response();
        if let Some((name, value)) = headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}
