//! Captive Portal Endpoint
//!
//! A minimal HTTP server whose sole job is to let a freshly-configured device pull down the CA
//! certificate without touching the interception path at all. It consumes the
//! CA component's output only; it owns no state of its own.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::cert::CertificateAuthority;
use crate::error::FatalInit;
use crate::metrics::Metrics;

pub struct PortalEndpoint {
    cert_authority: Arc<CertificateAuthority>,
    metrics: Arc<Metrics>,
}

impl PortalEndpoint {
    pub fn new(cert_authority: Arc<CertificateAuthority>, metrics: Arc<Metrics>) -> Self {
        Self {
            cert_authority,
            metrics,
        }
    }

    pub async fn serve(self: Arc<Self>, addr: std::net::SocketAddr) -> Result<(), FatalInit> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FatalInit::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(%addr, "captive portal listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept portal connection");
                    continue;
                }
            };
            let portal = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let portal = Arc::clone(&portal);
                    async move { portal.route(req) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(%peer, error = %e, "portal connection ended with an error");
                }
            });
        }
    }

    fn route<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible> {
        if req.method() != Method::GET {
            return Ok(not_found());
        }

        match req.uri().path() {
            "/ca.crt" => Ok(Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/x-x509-ca-cert")
                .body(Full::new(Bytes::from(self.cert_authority.ca_pem().to_string())))
                .expect("static ca.crt response is always valid")),
            "/" => Ok(Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain")
                .body(Full::new(Bytes::from(self.status_page())))
                .expect("static status page response is always valid")),
            _ => Ok(not_found()),
        }
    }

    /// Diagnostic status page only: listen ports and cache stats, no polyfill or CA markup
    /// content.
    fn status_page(&self) -> String {
        format!(
            "Revamp Proxy\ncache hit rate: {:.2}\nfetch the CA certificate at /ca.crt\n",
            self.metrics.cache_hit_rate()
        )
    }
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::new()))
        .expect("static 404 response is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn portal() -> PortalEndpoint {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let ca = Arc::new(CertificateAuthority::ensure_ca(dir.path(), Arc::clone(&metrics)).unwrap());
        PortalEndpoint::new(ca, metrics)
    }

    #[test]
    fn serves_the_ca_certificate_as_pem() {
        let portal = portal();
        let req = Request::builder()
            .method(Method::GET)
            .uri("/ca.crt")
            .body(())
            .unwrap();
        let resp = portal.route(req).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/x-x509-ca-cert"
        );
    }

    #[test]
    fn serves_a_status_page_at_root() {
        let portal = portal();
        let req = Request::builder().method(Method::GET).uri("/").body(()).unwrap();
        let resp = portal.route(req).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn unknown_paths_are_404() {
        let portal = portal();
        let req = Request::builder()
            .method(Method::GET)
            .uri("/nonexistent")
            .body(())
            .unwrap();
        let resp = portal.route(req).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
