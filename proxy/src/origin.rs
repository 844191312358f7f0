//! Origin Client
//!
//! Fetches the upstream response on behalf of the proxy: opens outbound TCP/TLS, speaks
//! HTTP/1.1, and decodes the response into a canonical [`HttpResponse`] the rest of the engine
//! works with.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{
    HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, USER_AGENT,
};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::OriginError;
use crate::hop_headers::strip_hop_by_hop;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_TIMEOUT: Duration = Duration::from_secs(10);
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(30);
const BODY_TIMEOUT: Duration = Duration::from_secs(60);

const MODERN_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Content-Type prefixes that are always streamed straight through rather than buffered, no
/// matter their size: media the pipeline would never transform anyway.
const STREAMING_CONTENT_PREFIXES: &[&str] =
    &["video/", "audio/", "multipart/", "application/octet-stream"];

/// Responses larger than this (per `Content-Length`) are streamed through rather than collected
/// into memory, even for otherwise-transformable content kinds.
pub const MAX_BUFFERABLE_BODY: usize = 8 * 1024 * 1024;

/// Boxed error type for the streamed response body so it can share one concrete `Body` type with
/// the buffered, fully in-memory path.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type every response the proxy hands back to a client is ultimately boxed into, so
/// the same `Response<_>` shape can carry either a fully materialized buffer or a body still
/// being streamed off the origin socket.
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// A hop-stripped origin response, either fully decoded in memory or still streaming.
///
/// [`fetch`](OriginClient::fetch) decides which variant to return before it ever reads the body:
/// large or inherently-streaming content (media, chunked transfers past
/// [`MAX_BUFFERABLE_BODY`]) comes back as `Streamed` so the caller can splice it straight to the
/// client without ever buffering it proxy-side.
#[derive(Debug)]
pub enum HttpResponse {
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Streamed {
        status: StatusCode,
        headers: HeaderMap,
        body: ResponseBody,
    },
}

impl HttpResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpResponse::Buffered { status, .. } => *status,
            HttpResponse::Streamed { status, .. } => *status,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            HttpResponse::Buffered { headers, .. } => headers,
            HttpResponse::Streamed { headers, .. } => headers,
        }
    }
}

/// What the caller wants fetched; `url` must be absolute (scheme + host + path).
pub struct OutgoingRequest {
    pub method: Method,
    pub url: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Whether a response this shape should be streamed straight through rather than buffered into
/// memory, decided from headers alone before a single body byte is read.
fn should_stream(content_type: Option<&str>, content_length: Option<usize>) -> bool {
    content_type
        .map(|ct| STREAMING_CONTENT_PREFIXES.iter().any(|p| ct.starts_with(p)))
        .unwrap_or(false)
        || content_length.map(|n| n > MAX_BUFFERABLE_BODY).unwrap_or(false)
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
    )
}

/// Fetches origin responses over fresh, non-pooled HTTP/1.1 connections.
pub struct OriginClient {
    allow_self_signed_origins: bool,
    spoof_user_agent: bool,
}

impl OriginClient {
    pub fn new(allow_self_signed_origins: bool, spoof_user_agent: bool) -> Self {
        Self {
            allow_self_signed_origins,
            spoof_user_agent,
        }
    }

    /// Fetch `request`, retrying at most once on a connect failure or a network error for an
    /// idempotent method (never on a 5xx response).
    pub async fn fetch(&self, request: OutgoingRequest) -> Result<HttpResponse, OriginError> {
        match self.fetch_once(&request).await {
            Ok(response) => Ok(response),
            Err(e) if is_idempotent(&request.method) && Self::is_retryable(&e) => {
                debug!(error = %e, "origin fetch failed, retrying once");
                self.fetch_once(&request).await
            }
            Err(e) => Err(e),
        }
    }

    fn is_retryable(error: &OriginError) -> bool {
        matches!(error, OriginError::Connect { .. } | OriginError::Io(_))
    }

    async fn fetch_once(&self, request: &OutgoingRequest) -> Result<HttpResponse, OriginError> {
        let host = request
            .url
            .host()
            .ok_or_else(|| OriginError::Protocol("request URL has no host".to_string()))?
            .to_string();
        let scheme = request.url.scheme_str().unwrap_or("http");
        let port = request
            .url
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });

        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| OriginError::Timeout("connect"))?
            .map_err(|source| OriginError::Connect {
                host: host.clone(),
                port,
                source,
            })?;

        if scheme == "https" {
            let stream = self.tls_connect(tcp, &host).await?;
            self.send_over(stream, request, &host, port).await
        } else {
            self.send_over(tcp, request, &host, port).await
        }
    }

    async fn tls_connect(
        &self,
        tcp: TcpStream,
        host: &str,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, OriginError> {
        let config = if self.allow_self_signed_origins {
            crate::tls_client::insecure_client_config()
        } else {
            crate::tls_client::verifying_client_config()
        };
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| OriginError::Tls(format!("invalid server name {host}: {e}")))?;

        tokio::time::timeout(TLS_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| OriginError::Timeout("tls handshake"))?
            .map_err(|e| OriginError::Tls(e.to_string()))
    }

    async fn send_over<IO>(
        &self,
        io: IO,
        request: &OutgoingRequest,
        host: &str,
        port: u16,
    ) -> Result<HttpResponse, OriginError>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(io);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| OriginError::Protocol(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "origin connection driver exited");
            }
        });

        let outgoing = self.build_request(request, host, port)?;

        let response = tokio::time::timeout(FIRST_BYTE_TIMEOUT, sender.send_request(outgoing))
            .await
            .map_err(|_| OriginError::Timeout("first byte"))?
            .map_err(|e| OriginError::Protocol(e.to_string()))?;

        let (parts, incoming) = response.into_parts();

        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());
        let content_length = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());

        if should_stream(content_type.as_deref(), content_length) {
            let mut headers = parts.headers;
            strip_hop_by_hop(&mut headers);
            let body = incoming
                .map_err(|e| Box::new(e) as BoxError)
                .boxed();
            return Ok(HttpResponse::Streamed {
                status: parts.status,
                headers,
                body,
            });
        }

        let collected = tokio::time::timeout(BODY_TIMEOUT, incoming.collect())
            .await
            .map_err(|_| OriginError::Timeout("body"))?
            .map_err(|e| OriginError::Protocol(e.to_string()))?;
        let raw_body = collected.to_bytes();

        let mut headers = parts.headers;
        let content_encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());

        let body = match content_encoding.as_deref() {
            Some(enc) => crate::compress::decode(enc, &raw_body)
                .await
                .map_err(OriginError::Protocol)?,
            None => raw_body.to_vec(),
        };

        headers.remove(CONTENT_ENCODING);
        headers.remove(CONTENT_LENGTH);
        strip_hop_by_hop(&mut headers);

        Ok(HttpResponse::Buffered {
            status: parts.status,
            headers,
            body: Bytes::from(body),
        })
    }

    fn build_request(
        &self,
        request: &OutgoingRequest,
        host: &str,
        port: u16,
    ) -> Result<Request<Full<Bytes>>, OriginError> {
        let path_and_query = request
            .url
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        let mut builder = Request::builder().method(request.method.clone()).uri(path_and_query);

        let headers_mut = builder
            .headers_mut()
            .ok_or_else(|| OriginError::Protocol("failed to build request".to_string()))?;
        *headers_mut = request.headers.clone();
        strip_hop_by_hop(headers_mut);

        let host_header = if (port == 80 && request.url.scheme_str() == Some("http"))
            || (port == 443 && request.url.scheme_str() == Some("https"))
        {
            host.to_string()
        } else {
            format!("{host}:{port}")
        };
        headers_mut.insert(
            HOST,
            HeaderValue::from_str(&host_header)
                .map_err(|e| OriginError::Protocol(e.to_string()))?,
        );
        headers_mut.insert("connection", HeaderValue::from_static("close"));
        if !headers_mut.contains_key(ACCEPT_ENCODING) {
            headers_mut.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        }
        if self.spoof_user_agent {
            headers_mut.insert(USER_AGENT, HeaderValue::from_static(MODERN_USER_AGENT));
        }

        let body = if request.body.is_empty() {
            Full::new(Bytes::new())
        } else {
            Full::new(request.body.clone())
        };

        builder
            .body(body)
            .map_err(|e| OriginError::Protocol(e.to_string()))
    }
}

/// Body type alias used by callers that need an empty-body request (e.g. GET synthesized by
/// the frontends before the pipeline rewrites it).
pub type EmptyBody = Empty<Bytes>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_methods_match_the_retry_policy() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::HEAD));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[test]
    fn connect_and_io_errors_are_retryable_but_protocol_errors_are_not() {
        assert!(OriginClient::is_retryable(&OriginError::Connect {
            host: "x".into(),
            port: 80,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        }));
        assert!(!OriginClient::is_retryable(&OriginError::Protocol(
            "bad".into()
        )));
        assert!(!OriginClient::is_retryable(&OriginError::Timeout("connect")));
    }

    #[test]
    fn media_content_types_stream_regardless_of_size() {
        assert!(should_stream(Some("video/mp4"), Some(100)));
        assert!(should_stream(Some("audio/mpeg"), None));
        assert!(should_stream(Some("multipart/form-data"), Some(10)));
    }

    #[test]
    fn oversize_bodies_stream_even_when_transformable() {
        assert!(should_stream(Some("text/html"), Some(MAX_BUFFERABLE_BODY + 1)));
        assert!(!should_stream(Some("text/html"), Some(MAX_BUFFERABLE_BODY)));
    }

    #[test]
    fn small_transformable_bodies_are_buffered() {
        assert!(!should_stream(Some("text/html"), Some(1024)));
        assert!(!should_stream(None, None));
    }
}
