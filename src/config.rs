//! Proxy configuration
//! An immutable table mapping public hosts to upstream hosts, built once at startup

use crate::error::ConfigError;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Canonical host of the provider/module registry
pub const REGISTRY_UPSTREAM: &str = "registry.terraform.io";

/// Canonical host of the release artifact downloads
pub const RELEASE_UPSTREAM: &str = "releases.hashicorp.com";

/// Terraform version announced to the upstream services
pub const DEFAULT_TERRAFORM_VERSION: &str = "1.1.7";

/// Responses whose `Server` header starts with this get their body rewritten
pub const DEFAULT_SERVER_PREFIX: &str = "terraform-registry";

/// Header set on responses whose `Location` was rewritten
pub const REWRITE_MARKER_HEADER: &str = "x-reverse-proxy";
pub const REWRITE_MARKER_VALUE: &str = "terraform-registry-proxy";

/// Upper bound on a response body buffered for rewriting, before and after decompression
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// One entry of the mapping table as written by an operator
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingSpec {
    pub public_host: String,
    pub upstream_host: String,
    /// Prepended to paths when links to the upstream are rewritten
    #[serde(default)]
    pub path_prefix: String,
    /// Rewrite embedded `https://<upstream_host>` links to point at the public host
    #[serde(default)]
    pub rewrite_links: bool,
    /// Headers injected into every request forwarded through this mapping
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Mapping table file format
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingFile {
    pub mappings: Vec<MappingSpec>,
    #[serde(default)]
    pub server_prefix: Option<String>,
}

/// A validated public host -> upstream host mapping
#[derive(Debug, Clone)]
pub struct HostMapping {
    public_host: Authority,
    upstream_host: Authority,
    path_prefix: String,
    rewrite_links: bool,
    headers: HeaderMap,
}

impl HostMapping {
    /// Validate a mapping entry
    pub fn new(spec: MappingSpec) -> Result<Self, ConfigError> {
        let public_host = parse_authority(&spec.public_host)?;
        let upstream_host = parse_authority(&spec.upstream_host)?;

        let path_prefix = spec.path_prefix.trim().trim_end_matches('/').to_string();
        if !path_prefix.is_empty() && !path_prefix.starts_with('/') {
            return Err(ConfigError::InvalidPathPrefix(spec.path_prefix));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in spec.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ConfigError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            let header_value =
                HeaderValue::from_str(&value).map_err(|e| ConfigError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            headers.insert(header_name, header_value);
        }

        Ok(Self {
            public_host,
            upstream_host,
            path_prefix,
            rewrite_links: spec.rewrite_links,
            headers,
        })
    }

    pub fn public_host(&self) -> &Authority {
        &self.public_host
    }

    pub fn upstream_host(&self) -> &Authority {
        &self.upstream_host
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn rewrite_links(&self) -> bool {
        self.rewrite_links
    }

    /// Compatibility headers injected on outbound requests
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Link prefix the upstream embeds in its responses
    pub fn upstream_url_prefix(&self) -> String {
        format!("https://{}", self.upstream_host)
    }

    /// Link prefix clients should see instead
    pub fn public_url_prefix(&self) -> String {
        format!("https://{}{}", self.public_host, self.path_prefix)
    }
}

/// Immutable proxy configuration shared by every request handler
#[derive(Debug, Clone)]
pub struct ProxyConfiguration {
    mappings: Vec<HostMapping>,
    server_prefix: String,
    marker: (HeaderName, HeaderValue),
    max_body_bytes: usize,
}

impl ProxyConfiguration {
    /// Build a configuration from an ordered mapping table
    pub fn new(mappings: Vec<HostMapping>) -> Result<Self, ConfigError> {
        if mappings.is_empty() {
            return Err(ConfigError::NoMappings);
        }

        for (i, mapping) in mappings.iter().enumerate() {
            if mappings[..i]
                .iter()
                .any(|m| m.public_host == mapping.public_host)
            {
                return Err(ConfigError::DuplicatePublicHost(
                    mapping.public_host.to_string(),
                ));
            }
        }

        Ok(Self {
            mappings,
            server_prefix: DEFAULT_SERVER_PREFIX.to_string(),
            marker: (
                HeaderName::from_static(REWRITE_MARKER_HEADER),
                HeaderValue::from_static(REWRITE_MARKER_VALUE),
            ),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    /// The standard two-entry table: registry first, release downloads second
    pub fn terraform(
        registry_host: &str,
        release_host: &str,
        release_path_prefix: &str,
        terraform_version: &str,
    ) -> Result<Self, ConfigError> {
        if registry_host.trim().is_empty() {
            return Err(ConfigError::Missing("registry proxy host"));
        }
        if release_host.trim().is_empty() {
            return Err(ConfigError::Missing("release proxy host"));
        }

        let user_agent = format!("Terraform/{}", terraform_version);

        let registry = MappingSpec {
            public_host: registry_host.to_string(),
            upstream_host: REGISTRY_UPSTREAM.to_string(),
            path_prefix: String::new(),
            rewrite_links: false,
            headers: BTreeMap::from([
                ("User-Agent".to_string(), user_agent.clone()),
                (
                    "X-Terraform-Version".to_string(),
                    terraform_version.to_string(),
                ),
            ]),
        };

        let release = MappingSpec {
            public_host: release_host.to_string(),
            upstream_host: RELEASE_UPSTREAM.to_string(),
            path_prefix: release_path_prefix.to_string(),
            rewrite_links: true,
            headers: BTreeMap::from([("User-Agent".to_string(), user_agent)]),
        };

        Self::new(vec![HostMapping::new(registry)?, HostMapping::new(release)?])
    }

    /// Load a mapping table from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let file: MappingFile =
            serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            })?;

        let mappings = file
            .mappings
            .into_iter()
            .map(HostMapping::new)
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self::new(mappings)?;
        Ok(match file.server_prefix {
            Some(prefix) => config.with_server_prefix(prefix),
            None => config,
        })
    }

    pub fn with_server_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.server_prefix = prefix.into();
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn mappings(&self) -> &[HostMapping] {
        &self.mappings
    }

    /// First entry of the table; redirect targets fall back to its public host
    pub fn primary(&self) -> &HostMapping {
        &self.mappings[0]
    }

    pub fn server_prefix(&self) -> &str {
        &self.server_prefix
    }

    pub fn marker(&self) -> (&HeaderName, &HeaderValue) {
        (&self.marker.0, &self.marker.1)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Find the mapping for an inbound host.
    /// The full authority is tried first, then the host with any port stripped.
    pub fn find_by_public_host(&self, host: &str) -> Option<&HostMapping> {
        let host = host.trim().to_ascii_lowercase();
        self.mappings
            .iter()
            .find(|m| m.public_host.as_str() == host)
            .or_else(|| {
                let bare = strip_port(&host);
                self.mappings.iter().find(|m| m.public_host.as_str() == bare)
            })
    }

    /// Find the mapping whose upstream is `host` (no port)
    pub fn find_by_upstream_host(&self, host: &str) -> Option<&HostMapping> {
        self.mappings
            .iter()
            .find(|m| m.upstream_host.host().eq_ignore_ascii_case(host))
    }
}

fn parse_authority(host: &str) -> Result<Authority, ConfigError> {
    let normalized = host.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(ConfigError::InvalidHost {
            host: host.to_string(),
            reason: "empty host".to_string(),
        });
    }
    if normalized.contains('@') {
        return Err(ConfigError::InvalidHost {
            host: host.to_string(),
            reason: "userinfo is not allowed".to_string(),
        });
    }
    normalized
        .parse::<Authority>()
        .map_err(|e| ConfigError::InvalidHost {
            host: host.to_string(),
            reason: e.to_string(),
        })
}

fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!host.contains(':') || host.ends_with(']')) =>
        {
            host
        }
        _ => authority,
    }
}
