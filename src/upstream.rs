//! Upstream transport
//! Sends directed requests to the upstream service over HTTPS

use crate::error::{BoxError, UpstreamError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{Request, Response};
use tracing::debug;

/// Body type flowing back to the client
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Wrap a buffered body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Something that can carry one request to the upstream and return its response
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<ProxyBody>, UpstreamError>;
}

/// HTTPS transport backed by a pooled `reqwest` client.
///
/// Redirects are returned to the caller instead of being followed, and bodies are
/// never decompressed on the way in.
#[derive(Clone)]
pub struct HttpsUpstream {
    client: reqwest::Client,
}

impl HttpsUpstream {
    pub fn new() -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpsUpstream {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<ProxyBody>, UpstreamError> {
        if request.uri().authority().is_none() {
            return Err(UpstreamError::NoUpstream(request.uri().to_string()));
        }

        let (parts, body) = request.into_parts();
        debug!("Sending {} {}", parts.method, parts.uri);

        let upstream_response = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await?;

        let status = upstream_response.status();
        let headers = upstream_response.headers().clone();

        let stream = upstream_response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);

        let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        Ok(response)
    }
}
