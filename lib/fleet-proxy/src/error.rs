use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No route matches: {0}")]
    RouteNotFound(String),

    #[error("Invalid target URL {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Route {0} must have at least one target")]
    EmptyTargets(String),

    #[error("Upstream {url} failed: {reason}")]
    Upstream { url: String, reason: String },

    #[error("Upstream {0} timed out")]
    UpstreamTimeout(String),
}
