//! Workload proxy errors.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("alias {0} is not registered")]
    UnknownAlias(String),

    #[error("no reachable upstream for {cluster}/{alias}")]
    NoUpstream { cluster: String, alias: String },

    #[error("upstream dial failed")]
    Dial(#[from] std::io::Error),

    #[error("upstream request failed")]
    Upstream(#[from] hyper::Error),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("redirect signature rejected")]
    RedirectSignature,

    #[error(transparent)]
    Http(#[from] http::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
