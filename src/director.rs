//! Request director
//! Points inbound requests at the upstream mapped to their public host

use crate::config::{HostMapping, ProxyConfiguration};
use hyper::header::{HeaderValue, HOST};
use hyper::http::uri::{Parts, PathAndQuery, Scheme};
use hyper::{Request, Uri};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RequestDirector {
    config: Arc<ProxyConfiguration>,
}

impl RequestDirector {
    pub fn new(config: Arc<ProxyConfiguration>) -> Self {
        Self { config }
    }

    /// Host the client addressed, from the `Host` header or an absolute-form URI
    pub fn inbound_host<B>(request: &Request<B>) -> Option<&str> {
        request
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| request.uri().authority().map(|a| a.as_str()))
    }

    /// Mapping for the request's host, if any
    pub fn resolve<B>(&self, request: &Request<B>) -> Option<&HostMapping> {
        Self::inbound_host(request).and_then(|host| self.config.find_by_public_host(host))
    }

    /// Rewrite the request in place to target the mapped upstream.
    ///
    /// Requests for unmapped hosts are left untouched.
    pub fn direct<B>(&self, request: &mut Request<B>) {
        let mapping = match self.resolve(request) {
            Some(m) => m,
            None => {
                debug!(
                    "No mapping for host {:?}, passing request through",
                    Self::inbound_host(request)
                );
                return;
            }
        };

        let path_and_query = request
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        let mut parts = Parts::default();
        parts.scheme = Some(Scheme::HTTPS);
        parts.authority = Some(mapping.upstream_host().clone());
        parts.path_and_query = Some(path_and_query);

        match Uri::from_parts(parts) {
            Ok(uri) => *request.uri_mut() = uri,
            Err(e) => {
                warn!("Failed to build upstream URI for {}: {}", mapping.upstream_host(), e);
                return;
            }
        }

        let headers = request.headers_mut();
        if let Ok(host) = HeaderValue::from_str(mapping.upstream_host().as_str()) {
            headers.insert(HOST, host);
        }
        for (name, value) in mapping.headers() {
            headers.insert(name.clone(), value.clone());
        }

        debug!(
            "Directed request to {} via {}",
            request.uri(),
            mapping.public_host()
        );
    }
}
