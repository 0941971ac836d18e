//! Accept loops for the daemon's two listeners.
//!
//! Peers connect over TCP+TLS; the interactive front-end talks to the
//! local Unix socket. Connections are served one by one through hyper so
//! each request carries a [`ConnectionMeta`] extension describing what the
//! transport knows about the caller (Unix socket, TLS peer certificates),
//! which is the material the auth gate judges.

use std::sync::Arc;

use anyhow::Result;
use axum::{Extension, Router};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use microcloud_core::Certificate;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::api::auth::ConnectionMeta;

/// Accept TLS connections and serve them until the task is aborted.
pub async fn serve_tls(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    router: Router,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (stream, remote) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    // Port scanners and health checks die here; not worth
                    // more than a debug line.
                    debug!("TLS handshake with {remote} failed: {e}");
                    return;
                }
            };

            let peer_certificates: Vec<Certificate> = stream
                .get_ref()
                .1
                .peer_certificates()
                .unwrap_or_default()
                .iter()
                .filter_map(|der| Certificate::from_der(der.to_vec()).ok())
                .collect();

            serve_connection(stream, router, ConnectionMeta::tls(peer_certificates)).await;
        });
    }
}

/// Accept Unix-socket connections from the local front-end.
pub async fn serve_unix(listener: UnixListener, router: Router) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let router = router.clone();

        tokio::spawn(async move {
            serve_connection(stream, router, ConnectionMeta::unix()).await;
        });
    }
}

async fn serve_connection<S>(stream: S, router: Router, meta: ConnectionMeta)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router.layer(Extension(meta)));

    // `with_upgrades` keeps the connection alive past the websocket
    // hijack point.
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("Connection ended with error: {e}");
    }
}
