//! registry-proxy - A rewriting reverse proxy for the Terraform registry
//!
//! Serves `registry.terraform.io` and `releases.hashicorp.com` under operator
//! controlled hostnames:
//! - Host-based routing from a public host -> upstream mapping table
//! - Compatibility headers injected per mapping
//! - Embedded upstream links rewritten in registry responses (gzip aware)
//! - Redirect targets pointed back at the public hosts

pub mod config;
pub mod director;
pub mod error;
pub mod interceptor;
pub mod proxy;
pub mod rewrite;
pub mod upstream;

pub use config::{HostMapping, MappingSpec, ProxyConfiguration};
pub use director::RequestDirector;
pub use error::{ConfigError, RewriteError, UpstreamError};
pub use interceptor::ResponseInterceptor;
pub use proxy::{ProxyEngine, ProxyServer};
pub use rewrite::{ContentRewriter, RedirectRewriter};
pub use upstream::{HttpsUpstream, ProxyBody, Upstream};
