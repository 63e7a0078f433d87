//! Request forwarding to remote engines.
//!
//! Provides an HTTP/1.1 client over TCP (optionally TLS) to forward
//! requests to the engine that owns a resource, with support for streaming
//! responses and HTTP upgrades (attach, exec).

use crate::error::{ApiError, Result};
use armada_cluster::transport::{dial, TlsConfig};
use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode, Uri};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Forward an HTTP request to an engine and return its response.
///
/// Opens a new HTTP/1.1 connection per request. The response body is
/// streamed lazily, so this works for both fixed-length and chunked
/// (streaming) responses like logs, events and pull progress.
///
/// # Errors
///
/// Returns an error if dialing, the handshake, or request forwarding fails.
pub async fn proxy_to_engine(
    tls: Option<&TlsConfig>,
    addr: &str,
    original_uri: &Uri,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let stream = dial(addr, tls).await?;

    let (mut sender, conn) = http1::Builder::new()
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ApiError::Transport(format!("engine handshake failed: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            let msg = e.to_string().to_lowercase();
            if !msg.contains("canceled") && !msg.contains("incomplete") {
                tracing::debug!("engine connection ended: {}", e);
            }
        }
    });

    let path_and_query = original_uri
        .path_and_query()
        .map_or("/", hyper::http::uri::PathAndQuery::as_str);
    let method = req.method().clone();
    let content_type = req.headers().get(header::CONTENT_TYPE).cloned();
    let body = req.into_body();

    let mut engine_req = hyper::Request::builder()
        .method(method)
        .uri(path_and_query)
        .body(body)
        .map_err(|e| ApiError::server(format!("failed to build engine request: {e}")))?;

    if let Some(ct) = content_type {
        engine_req.headers_mut().insert(header::CONTENT_TYPE, ct);
    }
    engine_req
        .headers_mut()
        .insert(header::HOST, host_header(addr));
    engine_req
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));

    let response = sender
        .send_request(engine_req)
        .await
        .map_err(|e| ApiError::Transport(format!("engine request failed: {e}")))?;

    let (parts, incoming) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(incoming)))
}

/// Forward an HTTP request with upgrade support to an engine.
///
/// Used for attach and exec endpoints that use HTTP upgrade (101 Switching
/// Protocols) for bidirectional streaming. After both sides upgrade, the
/// connections are bridged with [`bridge`]; the bridge runs until both
/// directions have drained, so one side closing its write half (ctrl-d on
/// an interactive attach) still lets remaining output flow the other way.
///
/// # Errors
///
/// Returns an error if dialing, the handshake, request forwarding, or
/// response construction fails.
pub async fn hijack(
    tls: Option<&TlsConfig>,
    addr: &str,
    original_uri: &Uri,
    mut client_req: Request<Body>,
) -> Result<Response<Body>> {
    let stream = dial(addr, tls).await?;

    let (mut sender, conn) = http1::Builder::new()
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ApiError::Transport(format!("engine handshake failed: {e}")))?;

    // The connection task must keep running for the upgrade to work.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            let msg = e.to_string().to_lowercase();
            if !msg.contains("canceled") && !msg.contains("incomplete") {
                tracing::debug!("engine upgrade connection ended: {}", e);
            }
        }
    });

    let path_and_query = original_uri
        .path_and_query()
        .map_or("/", hyper::http::uri::PathAndQuery::as_str);
    let req_body = std::mem::take(client_req.body_mut());

    let mut engine_req = hyper::Request::builder()
        .method(client_req.method())
        .uri(path_and_query)
        .body(req_body)
        .map_err(|e| ApiError::server(format!("failed to build engine request: {e}")))?;

    // Forward all headers except Host.
    for (key, value) in client_req.headers() {
        if key != header::HOST {
            engine_req.headers_mut().insert(key.clone(), value.clone());
        }
    }
    engine_req
        .headers_mut()
        .insert(header::HOST, host_header(addr));

    let engine_response = sender
        .send_request(engine_req)
        .await
        .map_err(|e| ApiError::Transport(format!("engine request failed: {e}")))?;

    if engine_response.status() != StatusCode::SWITCHING_PROTOCOLS {
        // Engine didn't upgrade; return its response as-is.
        let (parts, incoming) = engine_response.into_parts();
        return Ok(Response::from_parts(parts, Body::new(incoming)));
    }

    // Preserve content-type from the engine's 101 (raw-stream vs
    // multiplexed-stream).
    let content_type = engine_response.headers().get(header::CONTENT_TYPE).cloned();

    // Prepare both upgrade futures BEFORE returning the 101 to the client.
    let client_upgrade = hyper::upgrade::on(&mut client_req);
    let engine_upgrade = hyper::upgrade::on(engine_response);

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "tcp");
    if let Some(ct) = content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    let response = builder
        .body(Body::empty())
        .map_err(|e| ApiError::server(format!("failed to build upgrade response: {e}")))?;

    tokio::spawn(async move {
        let (client_io, engine_io) = match tokio::try_join!(client_upgrade, engine_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!("upgrade bridging setup failed: {}", e);
                return;
            }
        };
        match bridge(TokioIo::new(client_io), TokioIo::new(engine_io)).await {
            Ok((sent, received)) => {
                tracing::debug!(sent, received, "hijacked session closed");
            }
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if !msg.contains("broken pipe") && !msg.contains("connection reset") {
                    tracing::debug!("hijack bridge error: {}", e);
                }
            }
        }
    });

    Ok(response)
}

/// Bridges two byte streams with half-close semantics.
///
/// Two copy loops run concurrently, one per direction. When one side hits
/// EOF its loop shuts down the write half of the destination, signalling
/// end-of-input without tearing down the reverse direction. The call
/// returns only after both directions finish, with the byte counts
/// `(a_to_b, b_to_a)`.
///
/// # Errors
///
/// Returns the first I/O error from either direction, after both have
/// settled.
pub async fn bridge<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let n = tokio::io::copy(&mut a_read, &mut b_write).await?;
        b_write.shutdown().await?;
        Ok::<u64, io::Error>(n)
    };
    let b_to_a = async {
        let n = tokio::io::copy(&mut b_read, &mut a_write).await?;
        a_write.shutdown().await?;
        Ok::<u64, io::Error>(n)
    };

    let (sent, received) = tokio::join!(a_to_b, b_to_a);
    Ok((sent?, received?))
}

fn host_header(addr: &str) -> HeaderValue {
    HeaderValue::from_str(addr).unwrap_or_else(|_| HeaderValue::from_static("localhost"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bridge_relays_both_directions() {
        let (mut client, bridge_a) = tokio::io::duplex(64);
        let (mut engine, bridge_b) = tokio::io::duplex(64);
        let task = tokio::spawn(bridge(bridge_a, bridge_b));

        client.write_all(b"stdin data").await.unwrap();
        let mut buf = [0u8; 10];
        engine.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"stdin data");

        engine.write_all(b"stdout").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"stdout");

        drop(client);
        drop(engine);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bridge_half_close_keeps_reverse_direction_open() {
        let (client, bridge_a) = tokio::io::duplex(64);
        let (mut engine, bridge_b) = tokio::io::duplex(64);
        let task = tokio::spawn(bridge(bridge_a, bridge_b));

        // Client closes its write half (ctrl-d). The engine sees EOF but
        // can still send remaining output back.
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"exit\n").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut inbound = Vec::new();
        engine.read_to_end(&mut inbound).await.unwrap();
        assert_eq!(inbound, b"exit\n");

        engine.write_all(b"bye\n").await.unwrap();
        engine.shutdown().await.unwrap();

        let mut outbound = Vec::new();
        client_read.read_to_end(&mut outbound).await.unwrap();
        assert_eq!(outbound, b"bye\n");

        // Both directions have drained; the bridge reports the totals.
        let (sent, received) = task.await.unwrap().unwrap();
        assert_eq!(sent, 5);
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn bridge_ends_only_after_both_directions() {
        let (client, bridge_a) = tokio::io::duplex(64);
        let (mut engine, bridge_b) = tokio::io::duplex(64);
        let task = tokio::spawn(bridge(bridge_a, bridge_b));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.shutdown().await.unwrap();

        // One direction is finished; the bridge must still be running.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        engine.write_all(b"late output").await.unwrap();
        engine.shutdown().await.unwrap();
        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"late output");

        task.await.unwrap().unwrap();
    }
}
