//! Verification Driver
//!
//! Loads the rendered client configuration, brings up the virtual network
//! and makes one HTTP GET through it. Anything but a 200 fails the check.

use std::path::Path;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::config::RequestConfig;
use crate::error::{describe, Error, Result};
use crate::teardown::ReleaseStack;

/// Outcome of a successful check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub status: u16,
    pub body_len: usize,
}

/// Run the check against the configuration at `config_path`. Closing the
/// virtual network is registered on `releases`.
pub async fn verify(
    config_path: &Path,
    request: &RequestConfig,
    releases: &mut ReleaseStack,
) -> Result<Verification> {
    let config = wgnet::Config::load(config_path).map_err(Error::Config)?;
    let network = wgnet::Network::new(&config)
        .await
        .map_err(Error::NetworkInit)?;
    {
        let network = network.clone();
        releases.push(format!("virtual network {}", network.name()), move || async move {
            network.close();
            Ok(())
        });
    }

    let url = request.url();
    debug!("Dialing {} through {}", request.authority(), network.name());
    let stream = network
        .dial_timeout(&request.authority(), request.dial_timeout())
        .await
        .map_err(|e| Error::Request {
            url: url.clone(),
            reason: e.to_string(),
        })?;
    fetch(stream, request).await
}

/// Send one GET over an established connection and drain the response
pub async fn fetch<T>(io: T, request: &RequestConfig) -> Result<Verification>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let url = request.url();
    let failed = |e: &dyn std::error::Error| Error::Request {
        url: url.clone(),
        reason: describe(e),
    };

    let (mut sender, connection) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(io))
        .await
        .map_err(|e| failed(&e))?;
    let connection = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("HTTP connection ended: {}", e);
        }
    });

    let exchange = async {
        let req = Request::builder()
            .method(Method::GET)
            .uri(request.path.as_str())
            .header(HOST, request.host_header())
            .header(USER_AGENT, concat!("wgcheck/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(|e| failed(&e))?;
        let response = sender.send_request(req).await.map_err(|e| failed(&e))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| failed(&e))?
            .to_bytes();
        Ok((status, body.len()))
    };
    let result: Result<(StatusCode, usize)> = exchange.await;
    connection.abort();

    let (status, body_len) = result?;
    if status != StatusCode::OK {
        return Err(Error::UnexpectedStatus {
            url,
            status: status.as_u16(),
        });
    }
    info!("GET {} returned {} ({} bytes)", url, status, body_len);
    Ok(Verification {
        status: status.as_u16(),
        body_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Serve one canned response and hand back the request head
    async fn serve_once(response: &'static str) -> (TcpStream, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.ends_with(b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8(head).unwrap()
        });
        (TcpStream::connect(addr).await.unwrap(), server)
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        let (stream, server) =
            serve_once("HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello").await;
        let verification = fetch(stream, &RequestConfig::default()).await.unwrap();
        assert_eq!(verification, Verification { status: 200, body_len: 5 });

        let head = server.await.unwrap();
        assert!(head.starts_with("GET / HTTP/1.1\r\n"));
        assert!(head.to_ascii_lowercase().contains("host: web\r\n"));
    }

    #[tokio::test]
    async fn test_fetch_unexpected_status() {
        let (stream, _server) =
            serve_once("HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let err = fetch(stream, &RequestConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedStatus { status: 502, .. }), "{err}");
    }

    #[tokio::test]
    async fn test_fetch_garbage_response() {
        let (stream, _server) = serve_once("SSH-2.0-OpenSSH\r\n\r\n").await;
        let err = fetch(stream, &RequestConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::Request { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        // Gateway endpoint that swallows every datagram
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("wgnet.toml");
        let (host, port) = ("127.0.0.1", silent.local_addr().unwrap().port());
        let template = crate::config::CheckConfig::default().tunnel.template;
        crate::render::render(host, port, &template, &config_path).unwrap();

        let request = RequestConfig {
            dial_timeout_secs: 1,
            ..RequestConfig::default()
        };
        let mut releases = ReleaseStack::new();
        let err = verify(&config_path, &request, &mut releases).await.unwrap_err();
        assert!(matches!(err, Error::Request { .. }), "{err}");

        // The virtual network was still registered for release
        assert_eq!(releases.len(), 1);
        assert!(releases.release_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_config() {
        let mut releases = ReleaseStack::new();
        let err = verify(Path::new("/nonexistent/wgnet.toml"), &RequestConfig::default(), &mut releases)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.step(), "config");
        assert!(releases.is_empty());
    }
}
