//! Error types for configuration, rewriting and upstream transport

use std::path::PathBuf;
use thiserror::Error;

/// Boxed error used for body streams crossing the client/upstream boundary
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid or missing host mapping, detected while building the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("invalid path prefix '{0}': must be empty or start with '/'")]
    InvalidPathPrefix(String),

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("public host '{0}' is mapped more than once")]
    DuplicatePublicHost(String),

    #[error("no host mappings configured")]
    NoMappings,

    #[error("failed to read mapping file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse mapping file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure while rewriting a single upstream response
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("failed to decompress response body: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("failed to read response body: {0}")]
    BodyRead(#[source] BoxError),

    #[error("invalid Location header '{location}': {reason}")]
    RedirectParse { location: String, reason: String },
}

/// Failure while exchanging a request with the upstream
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no upstream host in request URL '{0}'")]
    NoUpstream(String),

    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}
