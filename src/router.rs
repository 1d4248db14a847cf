//! Virtual host router
//!
//! Dispatches each inbound request by hostname to a [`VirtualHost`], serving
//! it from the host's bundled asset directory when a matching file exists and
//! otherwise forwarding it to the host's real remote origin. Routing is
//! identical across the plaintext and TLS listeners.

use crate::config::{VirtualHost, DEFAULT_HOST, DOMAIN_FAMILY};
use crate::error::{full_body, BoxedBody};
use crate::upstream::OriginClient;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// CORS policy injected for the served domain family. Local policy takes
/// precedence over anything the origin returned.
const CORS_ALLOW_ORIGIN: &str = "*";
const CORS_ALLOW_HEADERS: &str = "Origin, X-Requested-With, Content-Type, Accept";
const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";

/// Hostname-keyed router over an immutable virtual host table.
pub struct HostRouter {
    hosts: Vec<VirtualHost>,
    /// Index of the host answering for unmatched hostnames
    default_index: usize,
    /// Domain-family suffix that receives the CORS policy
    cors_family: String,
    upstream: OriginClient,
}

impl HostRouter {
    /// Build a router over the given host table. The host named
    /// [`DEFAULT_HOST`] (or the first entry) becomes the default fallback.
    pub fn new(hosts: Vec<VirtualHost>) -> Self {
        assert!(!hosts.is_empty(), "virtual host table must not be empty");
        let default_index = hosts
            .iter()
            .position(|h| h.hostname == DEFAULT_HOST)
            .unwrap_or(0);

        Self {
            hosts,
            default_index,
            cors_family: DOMAIN_FAMILY.to_string(),
            upstream: OriginClient::new(),
        }
    }

    /// Override the CORS domain family (used by tests)
    pub fn with_cors_family(mut self, family: impl Into<String>) -> Self {
        self.cors_family = family.into();
        self
    }

    /// Select the virtual host for a hostname: exact case-insensitive match
    /// on the hostname or one of its aliases, else the default host.
    pub fn resolve(&self, hostname: Option<&str>) -> &VirtualHost {
        if let Some(hostname) = hostname {
            for host in &self.hosts {
                if host.hostname.eq_ignore_ascii_case(hostname)
                    || host.aliases.iter().any(|a| a.eq_ignore_ascii_case(hostname))
                {
                    return host;
                }
            }
        }
        &self.hosts[self.default_index]
    }

    /// Handle one inbound request: log, resolve the virtual host, try the
    /// static asset directory, fall back to the origin proxy, and apply the
    /// CORS policy last.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        let hostname = extract_hostname(&req);
        let effective_host = hostname.as_deref().unwrap_or(DEFAULT_HOST);

        // Every request is logged before dispatch, whatever the outcome
        info!(
            method = %req.method(),
            host = effective_host,
            path = req.uri().path(),
            "Incoming request"
        );

        let vhost = self.resolve(hostname.as_deref());

        let mut response = match self.try_static(vhost, req.uri().path()).await {
            Some(response) => response,
            None => {
                let (parts, body) = req.into_parts();
                self.upstream.forward(parts, body, &vhost.origin).await
            }
        };

        if let Some(ref hostname) = hostname {
            if self.in_cors_family(hostname) {
                apply_cors(&mut response);
            }
        }

        response
    }

    fn in_cors_family(&self, hostname: &str) -> bool {
        hostname == self.cors_family || hostname.ends_with(&format!(".{}", self.cors_family))
    }

    /// Attempt to satisfy the request from the host's asset directory.
    /// Returns `None` on any miss, including traversal attempts and unreadable
    /// files, so the caller falls through to the origin proxy.
    async fn try_static(&self, vhost: &VirtualHost, path: &str) -> Option<Response<BoxedBody>> {
        let candidate = resolve_asset_path(&vhost.asset_dir, path)?;

        let metadata = tokio::fs::metadata(&candidate).await.ok()?;
        let file_path = if metadata.is_dir() {
            candidate.join("index.html")
        } else {
            candidate
        };

        // Symlinks must not escape the asset root
        let canonical = tokio::fs::canonicalize(&file_path).await.ok()?;
        let canonical_root = tokio::fs::canonicalize(&vhost.asset_dir).await.ok()?;
        if !canonical.starts_with(&canonical_root) {
            debug!(host = %vhost.hostname, path, "Asset path escapes root, treating as miss");
            return None;
        }

        let contents = tokio::fs::read(&canonical).await.ok()?;
        let mime = mime_guess::from_path(&canonical).first_or_octet_stream();

        debug!(
            host = %vhost.hostname,
            file = %canonical.display(),
            bytes = contents.len(),
            "Serving bundled asset"
        );

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, mime.as_ref())
            .body(full_body(contents))
            .expect("valid response with StatusCode enum and mime header");

        Some(response)
    }
}

/// Map a request path into the asset directory. Segments are percent-decoded
/// before lookup, so encoded filenames (spaces, unicode) match their bundled
/// assets. Returns `None` for parent-directory segments, separators smuggled
/// through the encoding, or undecodable segments; those are routing misses,
/// not errors.
pub(crate) fn resolve_asset_path(asset_dir: &Path, path: &str) -> Option<PathBuf> {
    let mut resolved = asset_dir.to_path_buf();

    for raw in path.split('/') {
        if raw.is_empty() || raw == "." {
            continue;
        }
        let segment = urlencoding::decode(raw).ok()?;
        if segment.is_empty() || segment == "." {
            continue;
        }
        // The traversal guard applies to the decoded form
        if segment == ".." || segment.contains('/') || segment.contains('\\') {
            return None;
        }
        resolved.push(&*segment);
    }

    Some(resolved)
}

/// Extract and validate the request hostname from the Host header.
pub(crate) fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Alphanumeric, hyphen and dot only; anything else is unusable
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

/// Inject the permissive CORS policy, overwriting any origin-provided values.
fn apply_cors(response: &mut Response<BoxedBody>) {
    let headers = response.headers_mut();
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static(CORS_ALLOW_ORIGIN),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
}
