use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::query::HistoryQuery;
use crate::session::{Session, is_login_url};

pub const HISTORY_PATH: &str = "/games/history";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Timeouts, dropped connections, overloaded upstream. Worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The session is no longer accepted; the crawl cannot continue.
    #[error("session expired: {0}")]
    AuthExpired(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One round trip for one history page. Implementations never retry.
pub trait PageFetcher {
    fn fetch_page(
        &mut self,
        session: &Session,
        query: &HistoryQuery,
        page: u32,
    ) -> Result<String, FetchError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct HttpPageFetcher {
    request_count: usize,
}

impl HttpPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageFetcher for HttpPageFetcher {
    fn fetch_page(
        &mut self,
        session: &Session,
        query: &HistoryQuery,
        page: u32,
    ) -> Result<String, FetchError> {
        let url = session
            .base_url()
            .join(HISTORY_PATH)
            .map_err(|error| FetchError::Rejected(format!("invalid history URL: {error}")))?;

        self.request_count += 1;
        let response = session
            .client()
            .get(url)
            .query(&query.server_params(page))
            .send()
            .map_err(|error| classify_transport_error(&error))?;

        let status = response.status();
        let landed = response.url().clone();
        debug!(page, status = %status, url = %landed, "history page response");
        if is_login_url(&landed) {
            return Err(FetchError::AuthExpired(format!(
                "page {page} redirected to {landed}"
            )));
        }
        if let Some(error) = classify_status(status) {
            return Err(error);
        }

        response
            .text()
            .map_err(|error| FetchError::Transient(format!("failed to read page {page} body: {error}")))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let error = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FetchError::AuthExpired(format!("HTTP {status}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            FetchError::Transient(format!("HTTP {status}"))
        }
        status if status.is_server_error() => FetchError::Transient(format!("HTTP {status}")),
        status => FetchError::Rejected(format!("HTTP {status}")),
    };
    Some(error)
}

fn classify_transport_error(error: &reqwest::Error) -> FetchError {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        FetchError::Transient(error.to_string())
    } else {
        FetchError::Rejected(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{FetchError, classify_status};

    #[test]
    fn success_is_not_an_error() {
        assert_eq!(classify_status(StatusCode::OK), None);
    }

    #[test]
    fn auth_statuses_are_not_transient() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let error = classify_status(status).expect("error");
            assert!(matches!(error, FetchError::AuthExpired(_)));
            assert!(!error.is_transient());
        }
    }

    #[test]
    fn overload_statuses_are_transient() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            assert!(classify_status(status).expect("error").is_transient());
        }
    }

    #[test]
    fn other_client_errors_are_rejections() {
        let error = classify_status(StatusCode::NOT_FOUND).expect("error");
        assert_eq!(error, FetchError::Rejected("HTTP 404 Not Found".to_string()));
    }
}
