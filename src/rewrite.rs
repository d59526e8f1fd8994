//! Response rewriting
//! Replaces embedded upstream links in response bodies and rewrites redirect targets

use crate::config::{HostMapping, ProxyConfiguration};
use crate::error::RewriteError;
use bytes::Bytes;
use flate2::read::GzDecoder;
use hyper::header::{
    HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, LOCATION, TRANSFER_ENCODING,
};
use std::io::Read;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Encoding of a response body as far as rewriting is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Identity,
    Gzip,
    /// Anything else; the body is passed through untouched
    Unsupported,
}

impl BodyEncoding {
    /// Classify the `Content-Encoding` header of a response
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match headers.get(CONTENT_ENCODING).map(|v| v.to_str()) {
            None => BodyEncoding::Identity,
            Some(Ok(value)) => match value.trim().to_ascii_lowercase().as_str() {
                "" | "identity" => BodyEncoding::Identity,
                "gzip" | "x-gzip" => BodyEncoding::Gzip,
                _ => BodyEncoding::Unsupported,
            },
            Some(Err(_)) => BodyEncoding::Unsupported,
        }
    }
}

struct LinkRule {
    canonical: Vec<u8>,
    public: Vec<u8>,
}

/// Rewrites links to upstream hosts inside a fully buffered response body.
///
/// The body is held in memory in one piece because a link may straddle any chunk
/// boundary. Buffers are capped at the configured maximum body size.
pub struct ContentRewriter {
    rules: Vec<LinkRule>,
    max_body_bytes: usize,
}

impl ContentRewriter {
    pub fn new(config: &ProxyConfiguration) -> Self {
        let rules = config
            .mappings()
            .iter()
            .filter(|m| m.rewrite_links())
            .map(|m| LinkRule {
                canonical: m.upstream_url_prefix().into_bytes(),
                public: m.public_url_prefix().into_bytes(),
            })
            .collect();

        Self {
            rules,
            max_body_bytes: config.max_body_bytes(),
        }
    }

    /// Rewrite `body` and fix up the framing headers to match.
    ///
    /// A gzip body is decompressed and served uncompressed afterwards.
    /// `Content-Length` always ends up equal to the length of the returned body.
    pub fn rewrite(&self, headers: &mut HeaderMap, body: Bytes) -> Result<Bytes, RewriteError> {
        let mut body = match BodyEncoding::from_headers(headers) {
            BodyEncoding::Gzip => {
                let plain = self.gunzip(&body)?;
                headers.remove(CONTENT_ENCODING);
                Bytes::from(plain)
            }
            _ => body,
        };

        for rule in &self.rules {
            if let Some(replaced) = replace_all(&body, &rule.canonical, &rule.public) {
                body = Bytes::from(replaced);
            }
        }

        headers.remove(TRANSFER_ENCODING);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Ok(body)
    }

    fn gunzip(&self, compressed: &[u8]) -> Result<Vec<u8>, RewriteError> {
        let limit = self.max_body_bytes as u64;
        let mut decoder = GzDecoder::new(compressed).take(limit + 1);
        let mut plain = Vec::new();
        decoder
            .read_to_end(&mut plain)
            .map_err(RewriteError::Decompression)?;

        if plain.len() as u64 > limit {
            return Err(RewriteError::Decompression(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("decompressed body exceeds {} bytes", limit),
            )));
        }
        Ok(plain)
    }
}

/// Replace every occurrence of `from` in `haystack` with `to`.
/// Returns `None` when there is nothing to replace.
fn replace_all(haystack: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
    if from.is_empty() || haystack.len() < from.len() {
        return None;
    }

    let mut out: Option<Vec<u8>> = None;
    let mut last = 0;
    let mut i = 0;

    while i + from.len() <= haystack.len() {
        if &haystack[i..i + from.len()] == from {
            let buf = out.get_or_insert_with(|| Vec::with_capacity(haystack.len()));
            buf.extend_from_slice(&haystack[last..i]);
            buf.extend_from_slice(to);
            i += from.len();
            last = i;
        } else {
            i += 1;
        }
    }

    out.map(|mut buf| {
        buf.extend_from_slice(&haystack[last..]);
        buf
    })
}

/// Points absolute `Location` headers back at the public hosts
pub struct RedirectRewriter {
    config: Arc<ProxyConfiguration>,
}

impl RedirectRewriter {
    pub fn new(config: Arc<ProxyConfiguration>) -> Self {
        Self { config }
    }

    /// Rewrite the host of the `Location` header, if any.
    ///
    /// The new host is the public host mapped to the Location's upstream, falling back
    /// to the mapping that served the request and then to the first configured mapping.
    /// Only the authority is replaced; scheme, path, query and fragment are kept byte
    /// for byte. A path-absolute Location (`/path`) has no host, so it becomes a
    /// scheme-relative reference to the served public host (`//public/path`).
    pub fn rewrite(
        &self,
        headers: &mut HeaderMap,
        served: Option<&HostMapping>,
    ) -> Result<(), RewriteError> {
        let location = match headers.get(LOCATION) {
            Some(value) if !value.is_empty() => value,
            _ => return Ok(()),
        };

        let location = location
            .to_str()
            .map_err(|e| RewriteError::RedirectParse {
                location: String::from_utf8_lossy(location.as_bytes()).into_owned(),
                reason: e.to_string(),
            })?
            .to_string();

        let rewritten = if location.starts_with('/') && !location.starts_with("//") {
            let target = served.unwrap_or_else(|| self.config.primary());
            format!("//{}{}", target.public_host(), location)
        } else {
            let (url, host) = Self::locate_host(&location)?;
            let target = url
                .host_str()
                .and_then(|host| self.config.find_by_upstream_host(host))
                .or(served)
                .unwrap_or_else(|| self.config.primary());

            format!(
                "{}{}{}",
                &location[..host.start],
                target.public_host(),
                &location[host.end..]
            )
        };

        let value = HeaderValue::from_str(&rewritten).map_err(|e| RewriteError::RedirectParse {
            location: location.clone(),
            reason: e.to_string(),
        })?;

        debug!("Rewrote Location {} -> {}", location, rewritten);

        headers.insert(LOCATION, value);
        let (name, value) = self.config.marker();
        headers.insert(name.clone(), value.clone());
        Ok(())
    }

    /// Parse a Location that carries an authority and find the byte range of its
    /// `host[:port]` in the original string
    fn locate_host(location: &str) -> Result<(Url, Range<usize>), RewriteError> {
        let parse_error = |reason: String| RewriteError::RedirectParse {
            location: location.to_string(),
            reason,
        };

        let (url, authority_start) = if location.starts_with("//") {
            let url = Url::parse(&format!("https:{}", location))
                .map_err(|e| parse_error(e.to_string()))?;
            (url, 2)
        } else {
            let url = Url::parse(location).map_err(|e| parse_error(e.to_string()))?;
            let scheme_end = url.scheme().len();
            let has_authority = location
                .get(..scheme_end)
                .map_or(false, |scheme| scheme.eq_ignore_ascii_case(url.scheme()))
                && location[scheme_end..].starts_with("://");
            if !has_authority {
                return Err(parse_error("no authority component".to_string()));
            }
            (url, scheme_end + 3)
        };

        let authority_end = location[authority_start..]
            .find(|c: char| matches!(c, '/' | '?' | '#'))
            .map_or(location.len(), |i| authority_start + i);
        let host_start = location[authority_start..authority_end]
            .rfind('@')
            .map_or(authority_start, |i| authority_start + i + 1);

        if url.host_str().is_none() || host_start == authority_end {
            return Err(parse_error("no host".to_string()));
        }

        Ok((url, host_start..authority_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TERRAFORM_VERSION;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const UPSTREAM: &str = "https://releases.hashicorp.com";
    const PUBLIC: &str = "https://release.local/artifactory/hashicorp-releases";

    fn config() -> ProxyConfiguration {
        ProxyConfiguration::terraform(
            "registry.local",
            "release.local",
            "/artifactory/hashicorp-releases",
            DEFAULT_TERRAFORM_VERSION,
        )
        .unwrap()
    }

    fn gzip(payload: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn count(haystack: &[u8], needle: &str) -> usize {
        haystack
            .windows(needle.len())
            .filter(|w| *w == needle.as_bytes())
            .count()
    }

    #[test]
    fn test_replace_all() {
        assert_eq!(replace_all(b"aXbXc", b"X", b"--"), Some(b"a--b--c".to_vec()));
        assert_eq!(replace_all(b"XX", b"X", b""), Some(Vec::new()));
        assert_eq!(replace_all(b"abc", b"X", b"Y"), None);
        assert_eq!(replace_all(b"", b"X", b"Y"), None);
        assert_eq!(replace_all(b"aaa", b"aa", b"b"), Some(b"ba".to_vec()));
    }

    #[test]
    fn test_rewrite_length_law() {
        let rewriter = ContentRewriter::new(&config());

        for n in [1usize, 2, 5] {
            let body: String = (0..n)
                .map(|i| format!(r#"{{"url":"{}/terraform/{}/x.zip"}},"#, UPSTREAM, i))
                .collect();
            let original_len = body.len();

            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_LENGTH, HeaderValue::from(original_len));
            let out = rewriter.rewrite(&mut headers, Bytes::from(body)).unwrap();

            assert_eq!(count(&out, UPSTREAM), 0);
            assert_eq!(count(&out, PUBLIC), n);
            assert_eq!(out.len(), original_len + n * (PUBLIC.len() - UPSTREAM.len()));
            assert_eq!(headers[CONTENT_LENGTH], out.len().to_string().as_str());
        }
    }

    #[test]
    fn test_rewrite_without_match_is_identical() {
        let rewriter = ContentRewriter::new(&config());
        let body = Bytes::from_static(b"{\"url\":\"https://example.com/file\"}");

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        let out = rewriter.rewrite(&mut headers, body.clone()).unwrap();

        assert_eq!(out, body);
        assert_eq!(headers[CONTENT_LENGTH], body.len().to_string().as_str());
    }

    #[test]
    fn test_rewrite_is_case_sensitive() {
        let rewriter = ContentRewriter::new(&config());
        let body = Bytes::from_static(b"HTTPS://RELEASES.HASHICORP.COM/x");
        let out = rewriter.rewrite(&mut HeaderMap::new(), body.clone()).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn test_rewrite_gzip_body() {
        let rewriter = ContentRewriter::new(&config());
        let plain = format!("download from {}/terraform/1.1.7/", UPSTREAM);
        let compressed = gzip(plain.as_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(compressed.len()));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let out = rewriter.rewrite(&mut headers, Bytes::from(compressed)).unwrap();

        let expected = format!("download from {}/terraform/1.1.7/", PUBLIC);
        assert_eq!(out, expected.as_bytes());
        assert!(headers.get(CONTENT_ENCODING).is_none());
        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert_eq!(headers[CONTENT_LENGTH], expected.len().to_string().as_str());
    }

    #[test]
    fn test_rewrite_corrupt_gzip_fails() {
        let rewriter = ContentRewriter::new(&config());
        // Valid gzip header followed by a reserved deflate block type
        let mut corrupt = vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];
        corrupt.extend_from_slice(&[0xff; 16]);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let err = rewriter
            .rewrite(&mut headers, Bytes::from(corrupt))
            .unwrap_err();
        assert!(matches!(err, RewriteError::Decompression(_)));

        let err = rewriter
            .rewrite(&mut headers, Bytes::from_static(b"definitely not gzip"))
            .unwrap_err();
        assert!(matches!(err, RewriteError::Decompression(_)));
    }

    #[test]
    fn test_rewrite_gzip_over_limit_fails() {
        let rewriter = ContentRewriter::new(&config().with_max_body_bytes(16));
        let compressed = gzip(&[b'a'; 64]);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let err = rewriter
            .rewrite(&mut headers, Bytes::from(compressed))
            .unwrap_err();
        assert!(matches!(err, RewriteError::Decompression(_)));
    }

    #[test]
    fn test_body_encoding() {
        let mut headers = HeaderMap::new();
        assert_eq!(BodyEncoding::from_headers(&headers), BodyEncoding::Identity);

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("GZIP"));
        assert_eq!(BodyEncoding::from_headers(&headers), BodyEncoding::Gzip);

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert_eq!(BodyEncoding::from_headers(&headers), BodyEncoding::Unsupported);
    }

    fn location_headers(location: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_str(location).unwrap());
        headers
    }

    #[test]
    fn test_redirect_rewritten_to_public_host() {
        let rewriter = RedirectRewriter::new(Arc::new(config()));
        let mut headers = location_headers("https://registry.terraform.io/path?q=1");

        rewriter.rewrite(&mut headers, None).unwrap();

        assert_eq!(headers[LOCATION], "https://registry.local/path?q=1");
        assert_eq!(headers["x-reverse-proxy"], "terraform-registry-proxy");
    }

    #[test]
    fn test_redirect_to_release_upstream() {
        let config = Arc::new(config());
        let rewriter = RedirectRewriter::new(config.clone());
        let mut headers =
            location_headers("https://releases.hashicorp.com/terraform/1.1.7/?x=y");

        rewriter.rewrite(&mut headers, Some(config.primary())).unwrap();

        assert_eq!(headers[LOCATION], "https://release.local/terraform/1.1.7/?x=y");
    }

    #[test]
    fn test_redirect_unknown_host_uses_served_mapping() {
        let config = Arc::new(config());
        let rewriter = RedirectRewriter::new(config.clone());
        let mut headers = location_headers("http://cdn.example.com:8080/a/b");

        rewriter
            .rewrite(&mut headers, Some(&config.mappings()[1]))
            .unwrap();

        assert_eq!(headers[LOCATION], "http://release.local/a/b");
    }

    #[test]
    fn test_redirect_keeps_public_port() {
        let config = Arc::new(
            ProxyConfiguration::terraform("registry.local:8555", "release.local", "", "1.1.7")
                .unwrap(),
        );
        let rewriter = RedirectRewriter::new(config);
        let mut headers = location_headers("https://registry.terraform.io/v1/modules");

        rewriter.rewrite(&mut headers, None).unwrap();

        assert_eq!(headers[LOCATION], "https://registry.local:8555/v1/modules");
    }

    #[test]
    fn test_redirect_malformed_fails() {
        let rewriter = RedirectRewriter::new(Arc::new(config()));
        let mut headers = location_headers("not a url: a b c");

        let err = rewriter.rewrite(&mut headers, None).unwrap_err();
        assert!(matches!(err, RewriteError::RedirectParse { .. }));
        assert!(headers.get("x-reverse-proxy").is_none());
    }

    #[test]
    fn test_redirect_without_host_fails() {
        let rewriter = RedirectRewriter::new(Arc::new(config()));
        let mut headers = location_headers("mailto:ops@example.com");

        let err = rewriter.rewrite(&mut headers, None).unwrap_err();
        assert!(matches!(err, RewriteError::RedirectParse { .. }));
    }

    #[test]
    fn test_redirect_path_and_query_kept_verbatim() {
        let rewriter = RedirectRewriter::new(Arc::new(config()));

        let mut headers = location_headers("https://registry.terraform.io/a/../b?q=1");
        rewriter.rewrite(&mut headers, None).unwrap();
        assert_eq!(headers[LOCATION], "https://registry.local/a/../b?q=1");

        let mut headers = location_headers("https://registry.terraform.io");
        rewriter.rewrite(&mut headers, None).unwrap();
        assert_eq!(headers[LOCATION], "https://registry.local");

        let mut headers = location_headers("https://registry.terraform.io?q=%2F#frag");
        rewriter.rewrite(&mut headers, None).unwrap();
        assert_eq!(headers[LOCATION], "https://registry.local?q=%2F#frag");
    }

    #[test]
    fn test_redirect_keeps_userinfo() {
        let rewriter = RedirectRewriter::new(Arc::new(config()));
        let mut headers = location_headers("https://user:pw@releases.hashicorp.com:443/x");

        rewriter.rewrite(&mut headers, None).unwrap();

        assert_eq!(headers[LOCATION], "https://user:pw@release.local/x");
    }

    #[test]
    fn test_redirect_scheme_relative() {
        let rewriter = RedirectRewriter::new(Arc::new(config()));
        let mut headers = location_headers("//releases.hashicorp.com/terraform/");

        rewriter.rewrite(&mut headers, None).unwrap();

        assert_eq!(headers[LOCATION], "//release.local/terraform/");
        assert_eq!(headers["x-reverse-proxy"], "terraform-registry-proxy");
    }

    #[test]
    fn test_redirect_path_absolute_gets_public_host() {
        let config = Arc::new(config());
        let rewriter = RedirectRewriter::new(config.clone());

        let mut headers = location_headers("/v1/providers/hashicorp/aws");
        rewriter.rewrite(&mut headers, None).unwrap();
        assert_eq!(headers[LOCATION], "//registry.local/v1/providers/hashicorp/aws");
        assert_eq!(headers["x-reverse-proxy"], "terraform-registry-proxy");

        let mut headers = location_headers("/terraform/1.1.7/");
        rewriter
            .rewrite(&mut headers, Some(&config.mappings()[1]))
            .unwrap();
        assert_eq!(headers[LOCATION], "//release.local/terraform/1.1.7/");
    }

    #[test]
    fn test_no_location_is_noop() {
        let rewriter = RedirectRewriter::new(Arc::new(config()));
        let mut headers = HeaderMap::new();
        rewriter.rewrite(&mut headers, None).unwrap();
        assert!(headers.is_empty());
    }
}
