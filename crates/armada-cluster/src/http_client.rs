//! HTTP/1.1 implementation of [`EngineClient`].
//!
//! Opens a fresh connection per request (simplicity over latency, and no
//! stale-connection edge cases when engines restart). Bodies are small JSON
//! documents except the event stream, which is read incrementally.

use crate::client::{EngineClient, EventStream};
use crate::error::{ClusterError, Result};
use crate::transport::{self, TlsConfig};
use crate::types::{
    ContainerConfig, ContainerDetail, ContainerSummary, CreateContainerResponse, EngineEvent,
    EngineInfoDto, ImageSummary, NetworkCreateRequest, NetworkCreateResponse, NetworkResource,
    VolumeCreateRequest, VolumeListResponse, VolumeResource,
};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Remote engine client over HTTP/1.1 (plain TCP or TLS).
pub struct HttpEngineClient {
    addr: String,
    tls: Option<TlsConfig>,
    timeout: Duration,
}

impl HttpEngineClient {
    /// Creates a client for the engine at `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>, tls: Option<TlsConfig>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            tls,
            timeout,
        }
    }

    /// Returns the engine address this client dials.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<http1::SendRequest<Full<Bytes>>> {
        let stream = transport::dial(&self.addr, self.tls.as_ref()).await?;
        let (sender, conn) = http1::Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ClusterError::transport(format!("handshake with {}: {e}", self.addr)))?;

        let addr = self.addr.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(engine = %addr, "engine connection ended: {e}");
            }
        });
        Ok(sender)
    }

    fn build_request(&self, method: Method, path: &str, body: Bytes) -> Result<Request<Full<Bytes>>> {
        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(body))
            .map_err(|e| ClusterError::transport(format!("build request: {e}")))?;
        req.headers_mut()
            .insert(header::HOST, host_header(&self.addr));
        req.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(req)
    }

    /// One buffered round trip, bounded by the configured request timeout.
    async fn round_trip(&self, method: Method, path: &str, body: Bytes) -> Result<(StatusCode, Bytes)> {
        let fut = async {
            let mut sender = self.connect().await?;
            let req = self.build_request(method, path, body)?;
            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| ClusterError::transport(format!("request to {}: {e}", self.addr)))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ClusterError::transport(format!("read response: {e}")))?
                .to_bytes();
            Ok((status, bytes))
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ClusterError::Timeout(self.addr.clone()))?
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, body) = self.round_trip(Method::GET, path, Bytes::new()).await?;
        check_status(status, &body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn post(&self, path: &str, body: Bytes) -> Result<Bytes> {
        let (status, resp) = self.round_trip(Method::POST, path, body).await?;
        check_status(status, &resp)?;
        Ok(resp)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let (status, resp) = self.round_trip(Method::DELETE, path, Bytes::new()).await?;
        check_status(status, &resp)
    }

    /// POST whose response streams progress JSON; drains it fully so the
    /// operation completes before returning. These may legitimately exceed
    /// the standard request timeout.
    async fn post_streaming(&self, path: &str, body: Bytes) -> Result<()> {
        let mut sender = self.connect().await?;
        let req = self.build_request(Method::POST, path, body)?;
        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ClusterError::transport(format!("request to {}: {e}", self.addr)))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ClusterError::transport(format!("progress stream: {e}")))?
            .to_bytes();
        check_status(status, &body)
    }
}

fn host_header(addr: &str) -> HeaderValue {
    HeaderValue::from_str(addr).unwrap_or_else(|_| HeaderValue::from_static("localhost"))
}

fn check_status(status: StatusCode, body: &[u8]) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    Err(ClusterError::Remote {
        status: status.as_u16(),
        message: String::from_utf8_lossy(body).trim().to_string(),
    })
}

/// Percent-encodes a query parameter value.
fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn info(&self) -> Result<EngineInfoDto> {
        self.get_json("/info").await
    }

    async fn list_containers(
        &self,
        all: bool,
        id_filter: Option<&str>,
    ) -> Result<Vec<ContainerSummary>> {
        let mut path = format!("/containers/json?all={}", i32::from(all));
        if let Some(id) = id_filter {
            let filters = serde_json::json!({ "id": [id] }).to_string();
            path.push_str(&format!("&filters={}", url_encode(&filters)));
        }
        self.get_json(&path).await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail> {
        self.get_json(&format!("/containers/{id}/json")).await
    }

    async fn create_container(&self, name: &str, config: &ContainerConfig) -> Result<String> {
        let path = format!("/containers/create?name={}", url_encode(name));
        let body = Bytes::from(serde_json::to_vec(config)?);
        let resp = self.post(&path, body).await?;
        let created: CreateContainerResponse = serde_json::from_slice(&resp)?;
        Ok(created.id)
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<()> {
        self.delete(&format!(
            "/containers/{id}?force={}&v={}",
            i32::from(force),
            i32::from(volumes)
        ))
        .await
    }

    async fn rename_container(&self, id: &str, name: &str) -> Result<()> {
        self.post(
            &format!("/containers/{id}/rename?name={}", url_encode(name)),
            Bytes::new(),
        )
        .await?;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.post(&format!("/containers/{id}/start"), Bytes::new())
            .await?;
        Ok(())
    }

    async fn list_images(&self, all: bool) -> Result<Vec<ImageSummary>> {
        self.get_json(&format!("/images/json?all={}", i32::from(all)))
            .await
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let path = format!("/images/create?fromImage={}", url_encode(reference));
        self.post_streaming(&path, Bytes::new()).await
    }

    async fn import_image(&self, src: &str, repo: &str, tag: &str, body: Bytes) -> Result<()> {
        let mut path = format!("/images/create?fromSrc={}", url_encode(src));
        if !repo.is_empty() {
            path.push_str(&format!("&repo={}", url_encode(repo)));
        }
        if !tag.is_empty() {
            path.push_str(&format!("&tag={}", url_encode(tag)));
        }
        self.post_streaming(&path, body).await
    }

    async fn load_image(&self, body: Bytes) -> Result<()> {
        self.post_streaming("/images/load", body).await
    }

    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<()> {
        self.post(
            &format!(
                "/images/{id}/tag?repo={}&tag={}",
                url_encode(repo),
                url_encode(tag)
            ),
            Bytes::new(),
        )
        .await?;
        Ok(())
    }

    async fn remove_image(&self, id: &str, force: bool) -> Result<()> {
        self.delete(&format!("/images/{id}?force={}", i32::from(force)))
            .await
    }

    async fn list_networks(&self) -> Result<Vec<NetworkResource>> {
        self.get_json("/networks").await
    }

    async fn create_network(&self, req: &NetworkCreateRequest) -> Result<String> {
        let body = Bytes::from(serde_json::to_vec(req)?);
        let resp = self.post("/networks/create", body).await?;
        let created: NetworkCreateResponse = serde_json::from_slice(&resp)?;
        Ok(created.id)
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.delete(&format!("/networks/{id}")).await
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeResource>> {
        let resp: VolumeListResponse = self.get_json("/volumes").await?;
        Ok(resp.volumes)
    }

    async fn create_volume(&self, req: &VolumeCreateRequest) -> Result<VolumeResource> {
        let body = Bytes::from(serde_json::to_vec(req)?);
        let resp = self.post("/volumes/create", body).await?;
        Ok(serde_json::from_slice(&resp)?)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.delete(&format!("/volumes/{name}")).await
    }

    async fn events(&self) -> Result<EventStream> {
        let mut sender = self.connect().await?;
        let req = self.build_request(Method::GET, "/events", Bytes::new())?;
        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ClusterError::transport(format!("event subscription: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClusterError::Remote {
                status: resp.status().as_u16(),
                message: "event subscription rejected".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let addr = self.addr.clone();
        tokio::spawn(async move {
            forward_event_lines(resp, tx, addr).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Reads the chunked event body, splitting on newlines and forwarding one
/// parsed [`EngineEvent`] per line. Exits when the stream or the receiver
/// goes away.
async fn forward_event_lines(
    resp: Response<Incoming>,
    tx: mpsc::Sender<Result<EngineEvent>>,
    addr: String,
) {
    let mut body = resp.into_body();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                let _ = tx
                    .send(Err(ClusterError::transport(format!(
                        "event stream from {addr}: {e}"
                    ))))
                    .await;
                return;
            }
        };
        let Some(data) = frame.data_ref() else {
            continue;
        };
        buf.extend_from_slice(data);

        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<EngineEvent>(line) {
                Ok(event) => {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(engine = %addr, "unparseable event line: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_escapes_json() {
        assert_eq!(url_encode("a-b_c.d~"), "a-b_c.d~");
        assert_eq!(url_encode(r#"{"id":["x"]}"#), "%7B%22id%22%3A%5B%22x%22%5D%7D");
        assert_eq!(url_encode("repo:tag"), "repo%3Atag");
    }
}
