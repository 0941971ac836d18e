//! HTTPS client for the two calls a session makes to its peer.
//!
//! Both calls run over a raw TLS stream rather than a pooled HTTP client:
//! the joiner's first contact must capture the server certificate from the
//! TLS handshake (nothing else identifies the initiator yet), and every
//! later call pins that exact certificate.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use microcloud_core::{Certificate, HmacKey, JoinIntent, NodeStatus};
use rustls::pki_types::ServerName;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::context::SessionContext;
use crate::identity::Identity;
use crate::tls::{self, ServerVerify};
use crate::DEFAULT_PORT;

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// POST a signed join intent to the peer's `session/join` endpoint.
///
/// Returns the server certificate captured from the TLS handshake; with
/// [`ServerVerify::Insecure`] this is how the joiner first learns the
/// initiator's certificate.
pub async fn request_join_intent(
    ctx: &SessionContext,
    address: &str,
    identity: &Identity,
    verify: ServerVerify,
    hmac: &HmacKey,
    intent: &JoinIntent,
) -> Result<Certificate> {
    let body = serde_json::to_vec(intent).context("Failed to encode join intent")?;
    let authorization = hmac.authorization_header(&body);

    let (response_status, response_body, peer_cert) = ctx
        .run(request(
            address,
            identity,
            verify,
            Method::POST,
            "/1.0/session/join",
            Some(authorization),
            body,
        ))
        .await?;

    if !response_status.is_success() {
        bail!(remote_error(response_status, &response_body));
    }

    Ok(peer_cert)
}

/// GET the peer's status, pinning its known certificate.
pub async fn remote_status(
    ctx: &SessionContext,
    address: &str,
    identity: &Identity,
    pinned: &Certificate,
) -> Result<NodeStatus> {
    let (response_status, response_body, _) = ctx
        .run(request(
            address,
            identity,
            ServerVerify::Pinned(pinned.clone()),
            Method::GET,
            "/1.0/status",
            None,
            Vec::new(),
        ))
        .await?;

    if !response_status.is_success() {
        bail!(remote_error(response_status, &response_body));
    }

    serde_json::from_slice(&response_body).context("Failed to decode status response")
}

/// One HTTP/1.1 request over a fresh TLS connection. Returns the response
/// status, body, and the certificate the server presented.
async fn request(
    address: &str,
    identity: &Identity,
    verify: ServerVerify,
    method: Method,
    path: &str,
    authorization: Option<String>,
    body: Vec<u8>,
) -> Result<(http::StatusCode, Bytes, Certificate)> {
    let target = connect_address(address);
    let stream = TcpStream::connect(&target)
        .await
        .with_context(|| format!("Failed to connect to {target}"))?;

    let host = target
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(target.as_str())
        .to_string();
    let server_name =
        ServerName::try_from(host).map_err(|_| anyhow!("Invalid peer address {address:?}"))?;

    let connector = TlsConnector::from(tls::client_config(identity, verify)?);
    let stream = connector
        .connect(server_name, stream)
        .await
        .with_context(|| format!("TLS handshake with {target} failed"))?;

    let peer_cert = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| anyhow!("Peer {target} presented no certificate"))
        .and_then(|der| Ok(Certificate::from_der(der.to_vec())?))?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("HTTP handshake failed")?;
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, &target)
        .header(CONTENT_TYPE, "application/json");
    if let Some(authorization) = authorization {
        builder = builder.header(AUTHORIZATION, authorization);
    }
    let request = builder
        .body(Full::new(Bytes::from(body)))
        .context("Failed to build request")?;

    let response = sender
        .send_request(request)
        .await
        .with_context(|| format!("Request to {target}{path} failed"))?;
    let response_status = response.status();
    let response_body = response
        .into_body()
        .collect()
        .await
        .context("Failed to read response body")?
        .to_bytes();

    Ok((response_status, response_body, peer_cert))
}

/// Extract the error message a peer endpoint replied with.
fn remote_error(status: http::StatusCode, body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => parsed.error,
        Err(_) => format!("Peer replied with status {status}"),
    }
}

/// Complete a `host` address with the default port; `host:port` passes
/// through untouched.
fn connect_address(address: &str) -> String {
    match address.rsplit_once(':') {
        Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            address.to_string()
        }
        _ => format!("{address}:{DEFAULT_PORT}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_address() {
        assert_eq!(connect_address("10.0.0.1"), format!("10.0.0.1:{DEFAULT_PORT}"));
        assert_eq!(connect_address("10.0.0.1:9000"), "10.0.0.1:9000");
        assert_eq!(connect_address("node-a"), format!("node-a:{DEFAULT_PORT}"));
    }

    #[test]
    fn test_remote_error_prefers_body_message() {
        let body = br#"{"error":"Fingerprint already exists"}"#;
        assert_eq!(
            remote_error(http::StatusCode::BAD_REQUEST, body),
            "Fingerprint already exists"
        );
        assert_eq!(
            remote_error(http::StatusCode::BAD_GATEWAY, b"<html>"),
            "Peer replied with status 502 Bad Gateway"
        );
    }
}
