//! HTTP Proxy Frontend
//!
//! Speaks HTTP/1.1 with clients on the plain-proxy path and performs the TLS MITM state machine
//! on `CONNECT`. Plain requests and the inner stream of a MITM tunnel both end up
//! running through the same [`ResponsePipeline`]; only the request's framing (absolute-form URI
//! vs. a synthesized `https://host/...` built from the tunnel's SNI) differs.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::UPGRADE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::cert::CertResolver;
use crate::config::ConfigHandle;
use crate::error::{ClientProtocolError, FatalInit, RevampError};
use crate::origin::ResponseBody;
use crate::pipeline::{PipelineRequest, ResponsePipeline};

/// How long a MITM tunnel keeps its connection open between inner requests before it's torn
/// down.
const TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a single accepted connection needs to run either the plain-HTTP path or the
/// CONNECT/MITM path through the shared pipeline.
#[derive(Clone)]
pub struct HttpFrontend {
    pipeline: Arc<ResponsePipeline>,
    cert_authority: Arc<crate::cert::CertificateAuthority>,
    config: ConfigHandle,
    metrics: Arc<crate::metrics::Metrics>,
}

impl HttpFrontend {
    pub fn new(
        pipeline: Arc<ResponsePipeline>,
        cert_authority: Arc<crate::cert::CertificateAuthority>,
        config: ConfigHandle,
        metrics: Arc<crate::metrics::Metrics>,
    ) -> Self {
        Self {
            pipeline,
            cert_authority,
            config,
            metrics,
        }
    }

    /// Bind `addr` and serve connections until the process exits.
    pub async fn serve(self: Arc<Self>, addr: std::net::SocketAddr) -> Result<(), FatalInit> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FatalInit::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(%addr, "HTTP proxy frontend listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept HTTP proxy connection");
                    continue;
                }
            };
            let frontend = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = frontend.handle_connection(stream).await {
                    debug!(%peer, error = %e, "HTTP proxy connection ended with an error");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), RevampError> {
        let io = TokioIo::new(stream);
        let frontend = Arc::clone(&self);
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let frontend = Arc::clone(&frontend);
            async move { frontend.route(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| RevampError::ClientProtocol(ClientProtocolError::InvalidHeader(e.to_string())))
    }

    /// Top-level dispatch for one request on the plain-HTTP listener: `CONNECT` starts the MITM
    /// state machine, everything else goes straight to the pipeline.
    async fn route(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<ResponseBody>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req).await);
        }
        Ok(self.handle_plain(req).await)
    }

    /// Plain-form HTTP path: the request line already carries
    /// an absolute URI, so it's handed to the pipeline as-is.
    async fn handle_plain(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Response<ResponseBody> {
        if is_websocket_upgrade(&req) {
            // A plain, non-CONNECT request can't carry a second socket to splice into, so
            // there's no way to service an upgrade here.
            return bad_gateway("websocket upgrade requires a CONNECT tunnel");
        }

        let (parts, body) = req.into_parts();
        let url = parts.uri.clone();
        if url.host().is_none() {
            return client_error("request line must use absolute-form (GET http://host/path)");
        }

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return bad_gateway(&format!("failed to read request body: {e}")),
        };

        self.run_pipeline(PipelineRequest {
            method: parts.method,
            url,
            headers: parts.headers,
            body: body_bytes,
        })
        .await
    }

    /// `CONNECT` entry point: reply `200 Connection established`, then drive the TLS MITM state
    /// machine on the upgraded raw stream.
    async fn handle_connect(self: Arc<Self>, req: Request<hyper::body::Incoming>) -> Response<ResponseBody> {
        let authority = match req.uri().authority().map(|a| a.to_string()) {
            Some(a) => a,
            None => return client_error("CONNECT target must be host:port"),
        };
        let fallback_host = authority.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or(authority);

        let frontend = Arc::clone(&self);
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    frontend.run_tunnel(io, fallback_host).await;
                }
                Err(e) => {
                    debug!(error = %e, "CONNECT upgrade failed");
                }
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .expect("static 200 response is always valid")
    }

    /// `Handshake` -> `Tunneled(h)` -> `Closed`: complete a TLS server handshake on the raw
    /// CONNECT stream using a leaf minted for the ClientHello's SNI (or `fallback_host` when the
    /// hello carries none), then serve HTTP/1.1 requests on the decrypted stream until the
    /// client closes or goes idle.
    async fn run_tunnel<IO>(self: Arc<Self>, io: IO, fallback_host: String)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let resolver = CertResolver::new(Arc::clone(&self.cert_authority), fallback_host.clone());
        let acceptor = TlsAcceptor::from(Arc::new(resolver.server_config()));

        let tls_stream = match acceptor.accept(io).await {
            Ok(stream) => {
                self.metrics
                    .tls_handshakes_total
                    .with_label_values(&["ok"])
                    .inc();
                stream
            }
            Err(e) => {
                self.metrics
                    .tls_handshakes_total
                    .with_label_values(&["error"])
                    .inc();
                debug!(host = %fallback_host, error = %e, "TLS MITM handshake failed");
                return;
            }
        };

        let sni_host = tls_stream
            .get_ref()
            .1
            .server_name()
            .map(|s| s.to_string())
            .unwrap_or(fallback_host);

        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let io = TokioIo::new(IdleTrackingIo::new(tls_stream, Arc::clone(&last_activity)));
        let frontend = Arc::clone(&self);
        let tunnel_host = sni_host.clone();
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let frontend = Arc::clone(&frontend);
            let tunnel_host = tunnel_host.clone();
            async move { frontend.handle_tunneled_request(req, tunnel_host).await }
        });

        let conn = http1::Builder::new().serve_connection(io, service).with_upgrades();
        tokio::pin!(conn);

        // Reset on every byte read or written rather than capping the tunnel's total lifetime:
        // a connection actively serving requests for minutes must not be torn down just because
        // it's been open longer than one idle window.
        loop {
            let deadline = *last_activity.lock().expect("lock poisoned") + TUNNEL_IDLE_TIMEOUT;
            tokio::select! {
                result = &mut conn => {
                    match result {
                        Ok(()) => {}
                        Err(e) => debug!(host = %sni_host, error = %e, "tunnel connection ended with an error"),
                    }
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let idle_for = last_activity.lock().expect("lock poisoned").elapsed();
                    if idle_for >= TUNNEL_IDLE_TIMEOUT {
                        debug!(host = %sni_host, "tunnel idle timeout elapsed");
                        return;
                    }
                    // Activity landed while we were sleeping toward the old deadline; loop and
                    // wait out the new one.
                }
            }
        }
    }

    /// `Tunneled(h)` inner-request handling: synthesize the absolute `https://h/...` URL the
    /// plain path would have received directly, then reuse the same pipeline call.
    async fn handle_tunneled_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
        tunnel_host: String,
    ) -> Result<Response<ResponseBody>, Infallible> {
        if is_websocket_upgrade(&req) {
            return Ok(self.splice_websocket(req, &tunnel_host).await);
        }

        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let absolute = format!("https://{tunnel_host}{path_and_query}");
        let url: Uri = match absolute.parse() {
            Ok(u) => u,
            Err(e) => return Ok(client_error(&format!("failed to synthesize tunnel URL: {e}"))),
        };

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return Ok(bad_gateway(&format!("failed to read request body: {e}"))),
        };

        Ok(self
            .run_pipeline(PipelineRequest {
                method: parts.method,
                url,
                headers: parts.headers,
                body: body_bytes,
            })
            .await)
    }

    /// WebSocket upgrades bypass the pipeline entirely: open a plain TCP connection to the
    /// origin and splice bytes bidirectionally until either side closes.
    async fn splice_websocket(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
        tunnel_host: &str,
    ) -> Response<ResponseBody> {
        let (host, port) = match tunnel_host.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(443)),
            None => (tunnel_host.to_string(), 443),
        };

        self.metrics.websocket_upgrades_total.inc();
        let request_line = {
            let path = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
            format!("GET {path} HTTP/1.1\r\n")
        };
        let forwarded_headers = req.headers().clone();

        tokio::spawn(async move {
            let origin = match TcpStream::connect((host.as_str(), port)).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(%host, port, error = %e, "websocket origin connect failed");
                    return;
                }
            };

            let client_upgraded = match hyper::upgrade::on(req).await {
                Ok(u) => u,
                Err(e) => {
                    debug!(error = %e, "websocket client upgrade failed");
                    return;
                }
            };

            let mut origin = origin;
            let mut preamble = request_line;
            preamble.push_str(&format!("host: {host}\r\n"));
            for (name, value) in forwarded_headers.iter() {
                if name.as_str().eq_ignore_ascii_case("host") {
                    continue;
                }
                if let Ok(v) = value.to_str() {
                    preamble.push_str(&format!("{name}: {v}\r\n"));
                }
            }
            preamble.push_str("\r\n");

            use tokio::io::AsyncWriteExt;
            if let Err(e) = origin.write_all(preamble.as_bytes()).await {
                debug!(error = %e, "failed to forward websocket handshake to origin");
                return;
            }

            let mut client_upgraded = TokioIo::new(client_upgraded);
            if let Err(e) = tokio::io::copy_bidirectional(&mut client_upgraded, &mut origin).await {
                debug!(error = %e, "websocket splice ended");
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .body(empty_body())
            .expect("static 101 response is always valid")
    }

    async fn run_pipeline(&self, request: PipelineRequest) -> Response<ResponseBody> {
        let config = self.config.current();
        let method = request.method.to_string();
        let mut guard = crate::metrics::RequestMetricsGuard::new(Arc::clone(&self.metrics), method);

        match self.pipeline.run(request, &config).await {
            Ok(response) => {
                let status = response.status().as_u16();
                guard.set_cache_status("ok");
                let size = response
                    .headers()
                    .get(hyper::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                guard.finish(status, size);
                response
            }
            Err(e) => {
                guard.set_cache_status("error");
                if e.is_bad_gateway() {
                    self.metrics.bad_gateway_total.inc();
                }
                guard.finish(StatusCode::BAD_GATEWAY.as_u16(), 0);
                warn!(error = %e, "pipeline returned an error, answering 502");
                bad_gateway(&e.to_string())
            }
        }
    }
}

/// Wraps an `AsyncRead + AsyncWrite` stream, stamping a shared `Instant` on every successful
/// read or write so [`HttpFrontend::run_tunnel`] can reset its idle deadline on real activity
/// instead of capping the tunnel's total lifetime.
struct IdleTrackingIo<IO> {
    inner: IO,
    last_activity: Arc<Mutex<Instant>>,
}

impl<IO> IdleTrackingIo<IO> {
    fn new(inner: IO, last_activity: Arc<Mutex<Instant>>) -> Self {
        Self { inner, last_activity }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("lock poisoned") = Instant::now();
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for IdleTrackingIo<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let filled_before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(&result, Poll::Ready(Ok(()))) && buf.filled().len() > filled_before {
            this.touch();
        }
        result
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for IdleTrackingIo<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(&result, Poll::Ready(Ok(n)) if *n > 0) {
            this.touch();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn bad_gateway(message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(Bytes::from(format!("502 Bad Gateway: {message}"))))
        .expect("static 502 response is always valid")
}

fn client_error(message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(Bytes::from(format!("400 Bad Request: {message}"))))
        .expect("static 400 response is always valid")
}

/// Boxes a fully in-memory body into the `ResponseBody` type every response on this frontend is
/// framed as, matching the boxing the pipeline does for its own responses.
fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes)
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn empty_body() -> ResponseBody {
    full_body(Bytes::new())
}
