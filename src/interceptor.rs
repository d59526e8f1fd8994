//! Response interceptor
//! Runs the content and redirect rewriters over each upstream response

use crate::config::{HostMapping, ProxyConfiguration};
use crate::error::{BoxError, RewriteError};
use crate::rewrite::{BodyEncoding, ContentRewriter, RedirectRewriter};
use crate::upstream::{full_body, ProxyBody};
use bytes::Bytes;
use http_body_util::{BodyExt, Collected, Limited};
use hyper::header::SERVER;
use hyper::http::response::Parts;
use hyper::{Method, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

pub struct ResponseInterceptor {
    config: Arc<ProxyConfiguration>,
    content: ContentRewriter,
    redirect: RedirectRewriter,
}

impl ResponseInterceptor {
    pub fn new(config: Arc<ProxyConfiguration>) -> Self {
        Self {
            content: ContentRewriter::new(&config),
            redirect: RedirectRewriter::new(config.clone()),
            config,
        }
    }

    /// Rewrite an upstream response before it goes back to the client.
    ///
    /// `method` is the client's request method and `served` the mapping the request
    /// was directed through. Any error means the response must not be delivered.
    pub async fn intercept(
        &self,
        method: &Method,
        served: Option<&HostMapping>,
        response: Response<ProxyBody>,
    ) -> Result<Response<ProxyBody>, RewriteError> {
        let (mut parts, body) = response.into_parts();

        let body = if self.should_rewrite_body(method, &parts) {
            let collect: Pin<Box<dyn Future<Output = Result<Collected<Bytes>, BoxError>> + Send>> =
                Box::pin(Limited::new(body, self.config.max_body_bytes()).collect());
            let buffered = collect
                .await
                .map_err(RewriteError::BodyRead)?
                .to_bytes();
            full_body(self.content.rewrite(&mut parts.headers, buffered)?)
        } else {
            body
        };

        self.redirect.rewrite(&mut parts.headers, served)?;

        Ok(Response::from_parts(parts, body))
    }

    fn should_rewrite_body(&self, method: &Method, parts: &Parts) -> bool {
        let from_rewritten_server = parts
            .headers
            .get(SERVER)
            .and_then(|v| v.to_str().ok())
            .map(|server| server.starts_with(self.config.server_prefix()))
            .unwrap_or(false);
        if !from_rewritten_server {
            return false;
        }

        if *method == Method::HEAD || !has_body(parts.status) {
            return false;
        }

        if BodyEncoding::from_headers(&parts.headers) == BodyEncoding::Unsupported {
            debug!("Leaving body with unsupported Content-Encoding untouched");
            return false;
        }

        true
    }
}

fn has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}
