//! Public listeners and request handling
//!
//! One handler serves both listeners: determine the hostname, look up its
//! URL record, then either redirect or reverse-proxy. Every response leaves
//! with the security header set, and requests that already passed through
//! us (per `X-CDN-Loop`) are refused to break forwarding loops.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};
use url::Url;

use pendingdns_common::observability::metrics;
use pendingdns_common::PRODUCT_NAME;
use pendingdns_config::Config;
use pendingdns_store::{RecordSource, RecordType, RecordValue};

use super::pages::ErrorPages;
use super::tls::TlsGateway;

type HttpBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// HSTS for roughly 180 days.
const STRICT_TRANSPORT_SECURITY: &str = "max-age=15552000; includeSubDomains; preload";

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state of the public front end.
pub struct PublicContext {
    pub records: Arc<dyn RecordSource>,
    pub config: Arc<Config>,
    pub pages: ErrorPages,
    server_header: HeaderValue,
    http: reqwest::Client,
}

impl PublicContext {
    pub fn new(records: Arc<dyn RecordSource>, config: Arc<Config>) -> Arc<Self> {
        let pages = ErrorPages::load(&config.public);
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client");
        let server = config
            .public
            .server
            .clone()
            .unwrap_or_else(|| format!("{}/{}", PRODUCT_NAME, env!("CARGO_PKG_VERSION")));
        let server_header = HeaderValue::from_str(&server)
            .unwrap_or_else(|_| HeaderValue::from_static(PRODUCT_NAME));
        Arc::new(Self {
            records,
            config,
            pages,
            server_header,
            http,
        })
    }
}

/// Plain HTTP listener.
pub async fn run_http(ctx: Arc<PublicContext>, addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "public HTTP listener started");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "HTTP accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let ctx = ctx.clone();
                async move {
                    Ok::<_, Infallible>(handle_request(ctx, req, peer, "http").await)
                }
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                debug!(peer = %peer, error = %e, "HTTP connection ended with error");
            }
        });
    }
}

/// HTTPS listener: lazy TLS accept so the certificate is chosen (and, on a
/// cold name, issued) per SNI name.
pub async fn run_https(
    ctx: Arc<PublicContext>,
    gateway: Arc<TlsGateway>,
    addr: SocketAddr,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "public HTTPS listener started");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "HTTPS accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
            let start = match acceptor.await {
                Ok(start) => start,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "TLS client hello failed");
                    return;
                }
            };

            let sni = start.client_hello().server_name().map(str::to_string);
            let config = gateway.config_for_sni(sni.as_deref()).await;

            let tls = match start.into_stream(config).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(peer = %peer, sni = ?sni, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = service_fn(move |req| {
                let ctx = ctx.clone();
                async move {
                    Ok::<_, Infallible>(handle_request(ctx, req, peer, "https").await)
                }
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls), service)
                .await
            {
                debug!(peer = %peer, error = %e, "HTTPS connection ended with error");
            }
        });
    }
}

async fn handle_request(
    ctx: Arc<PublicContext>,
    req: Request<Incoming>,
    peer: SocketAddr,
    scheme: &'static str,
) -> Response<HttpBody> {
    // Refuse requests that already passed through a PendingDNS instance.
    if let Some(value) = req.headers().get("x-cdn-loop") {
        if value
            .to_str()
            .map(|v| v.contains(PRODUCT_NAME))
            .unwrap_or(false)
        {
            metrics().public_requests.with_label_values(&["loop"]).inc();
            return simple_response(
                &ctx,
                StatusCode::LOOP_DETECTED,
                ctx.pages.server_error.clone(),
            );
        }
    }

    let Some(hostname) = request_hostname(&req) else {
        metrics().public_requests.with_label_values(&["not_found"]).inc();
        return simple_response(&ctx, StatusCode::NOT_FOUND, ctx.pages.not_found.clone());
    };

    let rows = match ctx.records.resolve(&hostname, RecordType::Url, true).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(host = %hostname, error = %e, "URL record lookup failed");
            metrics().public_requests.with_label_values(&["error"]).inc();
            return simple_response(
                &ctx,
                StatusCode::INTERNAL_SERVER_ERROR,
                ctx.pages.server_error.clone(),
            );
        }
    };

    let Some(row) = rows.first() else {
        metrics().public_requests.with_label_values(&["not_found"]).inc();
        return simple_response(&ctx, StatusCode::NOT_FOUND, ctx.pages.not_found.clone());
    };
    let RecordValue::Url {
        url,
        status_code,
        proxy,
    } = row.value.clone()
    else {
        return simple_response(&ctx, StatusCode::NOT_FOUND, ctx.pages.not_found.clone());
    };

    if proxy {
        metrics().public_requests.with_label_values(&["proxy"]).inc();
        match proxy_request(&ctx, req, &url, &hostname, peer, scheme).await {
            Ok(response) => response,
            Err(e) => {
                warn!(host = %hostname, target = %url, error = %e, "proxy request failed");
                simple_response(&ctx, StatusCode::BAD_GATEWAY, ctx.pages.server_error.clone())
            }
        }
    } else {
        metrics().public_requests.with_label_values(&["redirect"]).inc();
        redirect_response(&ctx, &req, &url, status_code)
    }
}

/// Hostname from `:authority` (HTTP/2) or the Host header, without port or
/// brackets.
fn request_hostname(req: &Request<Incoming>) -> Option<String> {
    let raw = match req.uri().host() {
        Some(host) => host.to_string(),
        None => req
            .headers()
            .get(http::header::HOST)?
            .to_str()
            .ok()?
            .to_string(),
    };
    Some(strip_host_port(&raw))
}

/// `example.com:8443` → `example.com`, `[2001:db8::1]:443` → `2001:db8::1`.
fn strip_host_port(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_ascii_lowercase();
        }
    }
    match trimmed.rsplit_once(':') {
        // An unbracketed IPv6 address has more than one colon; keep it whole.
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => {
            host.to_ascii_lowercase()
        }
        _ => trimmed.to_ascii_lowercase(),
    }
}

fn redirect_response(
    ctx: &PublicContext,
    req: &Request<Incoming>,
    target: &str,
    status_code: u16,
) -> Response<HttpBody> {
    let location = redirect_location(
        target,
        req.uri().path(),
        req.uri().query(),
    )
    .unwrap_or_else(|| target.to_string());

    let status =
        StatusCode::from_u16(status_code).unwrap_or(StatusCode::MOVED_PERMANENTLY);
    let mut response = Response::builder()
        .status(status)
        .header(http::header::LOCATION, location)
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(ctx.pages.redirect_stub.clone()))
        .unwrap_or_else(|_| Response::new(full_body(String::new())));
    apply_security_headers(response.headers_mut(), &ctx.server_header);
    response
}

/// A bare target (path `/`, no query) aliases the incoming path and query
/// onto itself; anything else redirects verbatim.
fn redirect_location(target: &str, req_path: &str, req_query: Option<&str>) -> Option<String> {
    let mut url = Url::parse(target).ok()?;
    if url.path() == "/" && url.query().is_none() {
        url.set_path(req_path);
        url.set_query(req_query);
    }
    Some(url.to_string())
}

async fn proxy_request(
    ctx: &PublicContext,
    req: Request<Incoming>,
    target: &str,
    hostname: &str,
    peer: SocketAddr,
    scheme: &'static str,
) -> anyhow::Result<Response<HttpBody>> {
    let target_url = Url::parse(target)?;
    let origin_host = target_url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("proxy target has no host"))?;
    let mut origin = format!("{}://{}", target_url.scheme(), origin_host);
    if let Some(port) = target_url.port() {
        origin.push_str(&format!(":{}", port));
    }
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    // Capture the structured parts (hyper keeps pseudo-headers out of the
    // header map), then forward with the original Host.
    let method = req.method().clone();
    let mut headers = HeaderMap::new();
    for (name, value) in req.headers() {
        if !is_hop_by_hop(name) && name != http::header::HOST {
            headers.append(name.clone(), value.clone());
        }
    }
    headers.insert(
        http::header::HOST,
        HeaderValue::from_str(hostname)?,
    );
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static(scheme),
    );
    headers.insert(
        HeaderName::from_static("x-connecting-ip"),
        HeaderValue::from_str(&peer.ip().to_string())?,
    );

    let body_stream = req.into_body().into_data_stream();
    let upstream = ctx
        .http
        .request(method, format!("{}{}", origin, path_and_query))
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body_stream))
        .send()
        .await?;

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        apply_security_headers(headers, &ctx.server_header);
    }

    let body = StreamBody::new(
        upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    );
    Ok(builder.body(BodyExt::boxed(body))?)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn full_body(body: String) -> HttpBody {
    Full::new(Bytes::from(body))
        .map_err(|never| -> Box<dyn std::error::Error + Send + Sync> { match never {} })
        .boxed()
}

fn simple_response(ctx: &PublicContext, status: StatusCode, body: String) -> Response<HttpBody> {
    let mut response = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body(String::new())));
    apply_security_headers(response.headers_mut(), &ctx.server_header);
    response
}

/// The header set every response leaves with.
fn apply_security_headers(headers: &mut HeaderMap, server: &HeaderValue) {
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static(STRICT_TRANSPORT_SECURITY),
    );
    headers.insert(
        HeaderName::from_static("x-cdn-loop"),
        HeaderValue::from_static(PRODUCT_NAME),
    );
    headers.insert(http::header::SERVER, server.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_host_port() {
        assert_eq!(strip_host_port("example.com"), "example.com");
        assert_eq!(strip_host_port("Example.COM:8443"), "example.com");
        assert_eq!(strip_host_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_host_port("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(strip_host_port("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_redirect_location_aliases_bare_target() {
        assert_eq!(
            redirect_location("https://target.example/", "/some/path", Some("q=1")).unwrap(),
            "https://target.example/some/path?q=1"
        );
        assert_eq!(
            redirect_location("https://target.example/", "/", None).unwrap(),
            "https://target.example/"
        );
    }

    #[test]
    fn test_redirect_location_verbatim_when_target_has_path() {
        assert_eq!(
            redirect_location("https://target.example/landing", "/other", Some("x=1")).unwrap(),
            "https://target.example/landing"
        );
        assert_eq!(
            redirect_location("https://target.example/?keep=1", "/other", None).unwrap(),
            "https://target.example/?keep=1"
        );
    }

    #[test]
    fn test_security_headers_present() {
        let mut headers = HeaderMap::new();
        let server = HeaderValue::from_static("PendingDNS/0.9.2");
        apply_security_headers(&mut headers, &server);
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("x-cdn-loop").unwrap(), "PendingDNS");
        assert!(headers
            .get("strict-transport-security")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("max-age=15552000"));
        assert!(headers
            .get("server")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("PendingDNS/"));
    }

    #[test]
    fn test_hop_by_hop_filter() {
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }
}
