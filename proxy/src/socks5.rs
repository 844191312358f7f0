//! SOCKS5 Frontend
//!
//! Accepts legacy-device SOCKS5 clients (RFC 1928, NO AUTH only) and funnels `CONNECT` flows
//! into the HTTP Proxy Frontend over loopback, so TLS MITM has exactly one code path regardless
//! of which front door a client entered through.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{ClientProtocolError, FatalInit};
use crate::metrics::Metrics;

const SOCKS5_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_GENERAL_FAILURE: u8 = 0x01;

/// The address a SOCKS5 `CONNECT` targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedAddress {
    IpV4(Ipv4Addr),
    IpV6(Ipv6Addr),
    Domain(String),
}

impl ParsedAddress {
    /// The string a synthesized `CONNECT host:port` line should use for this address.
    pub fn host_string(&self) -> String {
        match self {
            ParsedAddress::IpV4(ip) => ip.to_string(),
            ParsedAddress::IpV6(ip) => format!("[{ip}]"),
            ParsedAddress::Domain(name) => name.clone(),
        }
    }
}

/// Accepts SOCKS5 connections and splices each `CONNECT` flow into the HTTP frontend listening
/// on `http_proxy_addr`.
pub struct Socks5Frontend {
    http_proxy_addr: SocketAddr,
    metrics: Arc<Metrics>,
}

impl Socks5Frontend {
    pub fn new(http_proxy_addr: SocketAddr, metrics: Arc<Metrics>) -> Self {
        Self {
            http_proxy_addr,
            metrics,
        }
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<(), FatalInit> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FatalInit::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(%addr, "SOCKS5 frontend listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept SOCKS5 connection");
                    continue;
                }
            };
            let frontend = Arc::clone(&self);
            frontend.metrics.socks5_connections_total.inc();
            tokio::spawn(async move {
                if let Err(e) = frontend.handle_connection(stream).await {
                    debug!(%peer, error = %e, "SOCKS5 connection ended with an error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut client: TcpStream) -> Result<(), ClientProtocolError> {
        self.handshake(&mut client).await?;
        let (cmd, address, port) = self.read_request(&mut client).await?;

        if cmd != CMD_CONNECT {
            self.reply(&mut client, REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Ok(());
        }

        match self.connect_via_http_frontend(&address, port).await {
            Ok(mut loopback) => {
                self.reply(&mut client, REPLY_SUCCEEDED).await?;
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut loopback).await {
                    debug!(error = %e, "SOCKS5 splice ended");
                }
            }
            Err(e) => {
                debug!(error = %e, "failed to establish loopback CONNECT tunnel");
                self.reply(&mut client, REPLY_GENERAL_FAILURE).await?;
            }
        }

        Ok(())
    }

    /// RFC 1928 method negotiation: only the NO AUTH method is ever offered.
    async fn handshake(&self, client: &mut TcpStream) -> Result<(), ClientProtocolError> {
        let mut header = [0u8; 2];
        client
            .read_exact(&mut header)
            .await
            .map_err(|_| ClientProtocolError::UnexpectedEof)?;
        let (version, nmethods) = (header[0], header[1]);
        if version != SOCKS5_VERSION {
            return Err(ClientProtocolError::UnsupportedSocksVersion(version));
        }

        let mut methods = vec![0u8; nmethods as usize];
        client
            .read_exact(&mut methods)
            .await
            .map_err(|_| ClientProtocolError::UnexpectedEof)?;

        if methods.contains(&NO_AUTH) {
            client
                .write_all(&[SOCKS5_VERSION, NO_AUTH])
                .await
                .map_err(|_| ClientProtocolError::UnexpectedEof)?;
            Ok(())
        } else {
            let _ = client.write_all(&[SOCKS5_VERSION, NO_ACCEPTABLE_METHODS]).await;
            Err(ClientProtocolError::InvalidHeader(
                "client offered no acceptable SOCKS5 auth method".to_string(),
            ))
        }
    }

    /// Parse a `VER CMD RSV ATYP DST.ADDR DST.PORT` request.
    async fn read_request(
        &self,
        client: &mut TcpStream,
    ) -> Result<(u8, ParsedAddress, u16), ClientProtocolError> {
        let mut prefix = [0u8; 4];
        client
            .read_exact(&mut prefix)
            .await
            .map_err(|_| ClientProtocolError::UnexpectedEof)?;
        let (version, cmd, _rsv, atyp) = (prefix[0], prefix[1], prefix[2], prefix[3]);
        if version != SOCKS5_VERSION {
            return Err(ClientProtocolError::UnsupportedSocksVersion(version));
        }

        let address = match atyp {
            ATYP_IPV4 => {
                let mut buf = [0u8; 4];
                client
                    .read_exact(&mut buf)
                    .await
                    .map_err(|_| ClientProtocolError::UnexpectedEof)?;
                ParsedAddress::IpV4(Ipv4Addr::from(buf))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 16];
                client
                    .read_exact(&mut buf)
                    .await
                    .map_err(|_| ClientProtocolError::UnexpectedEof)?;
                ParsedAddress::IpV6(Ipv6Addr::from(buf))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                client
                    .read_exact(&mut len)
                    .await
                    .map_err(|_| ClientProtocolError::UnexpectedEof)?;
                let mut buf = vec![0u8; len[0] as usize];
                client
                    .read_exact(&mut buf)
                    .await
                    .map_err(|_| ClientProtocolError::UnexpectedEof)?;
                let domain = String::from_utf8(buf)
                    .map_err(|e| ClientProtocolError::InvalidHeader(e.to_string()))?;
                ParsedAddress::Domain(domain)
            }
            other => return Err(ClientProtocolError::UnsupportedAddressType(other)),
        };

        let mut port_buf = [0u8; 2];
        client
            .read_exact(&mut port_buf)
            .await
            .map_err(|_| ClientProtocolError::UnexpectedEof)?;
        let port = u16::from_be_bytes(port_buf);

        Ok((cmd, address, port))
    }

    /// Reply with a bound address of `0.0.0.0:0` (the proxy never
    /// actually exposes a distinct bound port per flow).
    async fn reply(&self, client: &mut TcpStream, code: u8) -> Result<(), ClientProtocolError> {
        let mut response = vec![SOCKS5_VERSION, code, 0x00, ATYP_IPV4];
        response.extend_from_slice(&[0, 0, 0, 0]); // 0.0.0.0
        response.extend_from_slice(&[0, 0]); // port 0
        client
            .write_all(&response)
            .await
            .map_err(|_| ClientProtocolError::UnexpectedEof)
    }

    /// Open a loopback TCP connection to the HTTP Proxy Frontend and synthesize a `CONNECT`
    /// request into it, returning the raw socket once the tunnel is established.
    async fn connect_via_http_frontend(
        &self,
        address: &ParsedAddress,
        port: u16,
    ) -> std::io::Result<TcpStream> {
        let mut loopback = TcpStream::connect(self.http_proxy_addr).await?;
        let target = format!("{}:{port}", address.host_string());
        let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        loopback.write_all(request.as_bytes()).await?;

        let mut buf = Vec::with_capacity(128);
        let mut byte = [0u8; 1];
        loop {
            let n = loopback.read(&mut byte).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "loopback connection closed before CONNECT response completed",
                ));
            }
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n\r\n") {
                break;
            }
        }

        let status_line = String::from_utf8_lossy(&buf);
        if !status_line.contains("200") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("loopback CONNECT failed: {}", status_line.lines().next().unwrap_or("")),
            ));
        }

        Ok(loopback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_string_formats_each_address_kind() {
        assert_eq!(
            ParsedAddress::IpV4(Ipv4Addr::new(1, 2, 3, 4)).host_string(),
            "1.2.3.4"
        );
        assert_eq!(
            ParsedAddress::Domain("example.com".to_string()).host_string(),
            "example.com"
        );
        assert_eq!(
            ParsedAddress::IpV6(Ipv6Addr::LOCALHOST).host_string(),
            "[::1]"
        );
    }

    #[tokio::test]
    async fn handshake_accepts_no_auth_method() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let frontend = Socks5Frontend::new(addr, Arc::clone(&metrics));

        let writer_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[SOCKS5_VERSION, 1, NO_AUTH]).await.unwrap();
            let mut reply = [0u8; 2];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });
        let (mut accepted, _) = listener.accept().await.unwrap();
        frontend.handshake(&mut accepted).await.unwrap();
        let reply = writer_task.await.unwrap();

        assert_eq!(reply, [SOCKS5_VERSION, NO_AUTH]);
    }

    #[tokio::test]
    async fn request_parses_domain_address_and_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let frontend = Socks5Frontend::new("127.0.0.1:1".parse().unwrap(), metrics);

        let payload: Vec<u8> = {
            let mut p = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN];
            p.push(11);
            p.extend_from_slice(b"example.com");
            p.extend_from_slice(&443u16.to_be_bytes());
            p
        };
        let writer_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&payload).await.unwrap();
            stream
        });
        let (mut accepted, _) = listener.accept().await.unwrap();
        let (cmd, address, port) = frontend.read_request(&mut accepted).await.unwrap();
        let _ = writer_task.await.unwrap();

        assert_eq!(cmd, CMD_CONNECT);
        assert_eq!(address, ParsedAddress::Domain("example.com".to_string()));
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn reply_writes_a_zero_bound_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let frontend = Socks5Frontend::new(addr, metrics);

        let writer_task = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (mut accepted, _) = listener.accept().await.unwrap();
        frontend.reply(&mut accepted, REPLY_SUCCEEDED).await.unwrap();
        let mut client = writer_task.await.unwrap();

        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [SOCKS5_VERSION, REPLY_SUCCEEDED, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
    }
}
