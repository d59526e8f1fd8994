//! Proxy engine and server
//! Directs each request, forwards it upstream and rewrites the response

use crate::config::ProxyConfiguration;
use crate::director::RequestDirector;
use crate::error::UpstreamError;
use crate::interceptor::ResponseInterceptor;
use crate::upstream::{full_body, ProxyBody, Upstream};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Headers that apply to a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Wires the director and interceptor around one upstream transport
pub struct ProxyEngine<U> {
    director: RequestDirector,
    interceptor: ResponseInterceptor,
    upstream: U,
}

impl<U: Upstream> ProxyEngine<U> {
    pub fn new(config: Arc<ProxyConfiguration>, upstream: U) -> Self {
        Self {
            director: RequestDirector::new(config.clone()),
            interceptor: ResponseInterceptor::new(config),
            upstream,
        }
    }

    /// Proxy one buffered request. Failures become a 502 response.
    pub async fn handle(
        &self,
        req: Request<Bytes>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<ProxyBody> {
        match self.forward(req, remote_addr).await {
            Ok(response) => response,
            Err(e) => {
                error!("Proxy error: {:#}", e);
                Self::error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    async fn forward(
        &self,
        mut req: Request<Bytes>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Response<ProxyBody>> {
        let method = req.method().clone();

        // Unmapped hosts are passed through by the director but never sent anywhere
        let served = match self.director.resolve(&req) {
            Some(mapping) => mapping,
            None => {
                let host = RequestDirector::inbound_host(&req).unwrap_or("-").to_string();
                return Err(UpstreamError::NoUpstream(host).into());
            }
        };

        strip_hop_by_hop(req.headers_mut());
        if let Some(addr) = remote_addr {
            append_forwarded_for(req.headers_mut(), addr);
        }
        self.director.direct(&mut req);

        let mut response = self.upstream.send(req).await?;
        strip_hop_by_hop(response.headers_mut());

        let response = self
            .interceptor
            .intercept(&method, Some(served), response)
            .await?;
        Ok(response)
    }

    /// Create error response
    fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(Bytes::from(message.to_string())));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert("content-type", HeaderValue::from_static("text/plain"));
        response
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Connection may name further per-hop headers
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let client = addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client),
        None => client,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// HTTP front end serving a proxy engine
pub struct ProxyServer<U> {
    engine: Arc<ProxyEngine<U>>,
}

impl<U: Upstream + 'static> ProxyServer<U> {
    pub fn new(engine: ProxyEngine<U>) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn run(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("HTTP server listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let engine = self.engine.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, remote_addr, engine).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        engine: Arc<ProxyEngine<U>>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let engine = engine.clone();
                    async move { Self::handle_request(req, remote_addr, engine).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request, logging one access line per exchange
    async fn handle_request(
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        engine: Arc<ProxyEngine<U>>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());
        let host = RequestDirector::inbound_host(&req)
            .unwrap_or("-")
            .to_string();

        let (parts, body) = req.into_parts();
        let response = match body.collect().await {
            Ok(collected) => {
                let req = Request::from_parts(parts, collected.to_bytes());
                engine.handle(req, Some(remote_addr)).await
            }
            Err(e) => {
                error!("Failed to read request body: {}", e);
                ProxyEngine::<U>::error_response(StatusCode::BAD_REQUEST, "Bad Request")
            }
        };

        info!(
            target: "access",
            "{} {} {} {} {} {}ms",
            remote_addr.ip(),
            host,
            method,
            path,
            response.status().as_u16(),
            started.elapsed().as_millis()
        );

        Ok(response)
    }
}
