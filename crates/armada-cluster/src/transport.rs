//! Raw connection dialing for remote engines.
//!
//! Both the typed [`crate::client::HttpEngineClient`] and the API layer's
//! proxy/hijack path dial engines through here, so TLS handling lives in
//! exactly one place. The cluster's client certificate is reused for every
//! engine; plain TCP is used when no TLS config is present.

use crate::error::{ClusterError, Result};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Shared TLS client configuration (root CA plus optional client cert).
pub type TlsConfig = Arc<ClientConfig>;

/// A dialed engine connection, plain or TLS.
pub enum EngineStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for EngineStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for EngineStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dials `addr` (`host:port`), wrapping in TLS when a config is supplied.
///
/// # Errors
///
/// Returns an error if the TCP connect or TLS handshake fails, or if the
/// host part of `addr` is not a valid TLS server name.
pub async fn dial(addr: &str, tls: Option<&TlsConfig>) -> Result<EngineStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ClusterError::transport(format!("dial {addr}: {e}")))?;

    let Some(config) = tls else {
        return Ok(EngineStream::Plain(stream));
    };

    let host = addr.rsplit_once(':').map_or(addr, |(h, _)| h);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ClusterError::transport(format!("invalid TLS server name {host:?}")))?;
    let connector = TlsConnector::from(Arc::clone(config));
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ClusterError::transport(format!("TLS handshake with {addr}: {e}")))?;
    Ok(EngineStream::Tls(Box::new(tls_stream)))
}

/// Loads a TLS client configuration from PEM files.
///
/// `ca` verifies the engines' server certificates; `cert`/`key` supply the
/// cluster's client certificate when the engines require mutual TLS.
///
/// # Errors
///
/// Returns an error if any file cannot be read or parsed.
pub fn load_tls_config(
    ca: &Path,
    cert_and_key: Option<(&Path, &Path)>,
) -> Result<TlsConfig> {
    let mut roots = RootCertStore::empty();
    let ca_pem = std::fs::read(ca)?;
    for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
        let cert = cert.map_err(|e| ClusterError::transport(format!("bad CA cert: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| ClusterError::transport(format!("bad CA cert: {e}")))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match cert_and_key {
        Some((cert_path, key_path)) => {
            let cert_pem = std::fs::read(cert_path)?;
            let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ClusterError::transport(format!("bad client cert: {e}")))?;
            let key_pem = std::fs::read(key_path)?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .map_err(|e| ClusterError::transport(format!("bad client key: {e}")))?
                .ok_or_else(|| ClusterError::transport("no private key found".to_string()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClusterError::transport(format!("client cert setup: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}
