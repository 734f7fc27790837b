//! Error types for policy construction and URL rewriting

use thiserror::Error;

/// Invalid listen or redirect parameters. Always fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Host must not be empty")]
    EmptyHost,

    #[error("Port must be between 1 and 65535")]
    InvalidPort,

    #[error("Intercepted domain suffix must not be empty")]
    EmptyDomainSuffix,

    #[error("Gateway path marker must not be empty")]
    EmptyGatewayMarker,

    #[error("Invalid redirect target '{0}'")]
    InvalidTarget(String),
}

/// A request URL that could not be rewritten
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("Failed to parse request URL '{url}': {source}")]
    UnparseableUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Cannot replace the authority of '{0}'")]
    CannotReplaceAuthority(String),
}
