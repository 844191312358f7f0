//! Shared fixtures for integration tests: a minimal HTTP/1.1 origin server that the pipeline's
//! real `OriginClient` can dial over loopback TCP, since the pipeline has no mock-origin seam.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Starts a one-shot plain-HTTP origin on loopback that replies with a fixed status/headers/body
/// to every request it accepts, then returns its address. The server is dropped once `accepts`
/// requests have been served.
pub async fn spawn_origin(
    status_line: &'static str,
    content_type: &'static str,
    body: &'static [u8],
    accepts: usize,
) -> std::net::SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for _ in 0..accepts {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };

            // Drain and discard the request; these tests don't assert on request framing.
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;

            let response = format!(
                "{status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.write_all(body).await;
            let _ = stream.shutdown().await;
        }
    });

    addr
}

/// A [`revamp_proxy::blocklist::BlockListPredicate`] stand-in for tests that need to force the
/// 204 short-circuit without depending on the built-in ad/tracker hostnames.
pub struct BlockByHost(pub &'static str);

impl revamp_proxy::blocklist::BlockListPredicate for BlockByHost {
    fn should_block(&self, host: &str, _remove_ads: bool, _remove_tracking: bool) -> bool {
        host == self.0
    }
}
