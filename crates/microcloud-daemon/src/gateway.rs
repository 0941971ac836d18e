//! Framed JSON control channel between the daemon and the front-end.
//!
//! Wraps one upgraded websocket. A spawned read task forwards inbound
//! message bodies to an internal channel and cancels the session context
//! when the socket dies. After the HTTP connection has been hijacked for
//! the upgrade, terminal errors can only travel through the websocket
//! close frame, which is what [`WebsocketGateway::write_close`] is for.

use anyhow::{anyhow, bail, Context, Result};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use microcloud_core::SessionFrame;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::SessionContext;

pub struct WebsocketGateway {
    write: Mutex<SplitSink<WebSocket, Message>>,
    read_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    context: SessionContext,
    read_task: JoinHandle<()>,
}

impl WebsocketGateway {
    /// Wrap an upgraded websocket, spawning the read loop.
    pub fn new(socket: WebSocket, context: SessionContext) -> Self {
        let (write, read) = socket.split();
        let (read_tx, read_rx) = mpsc::unbounded_channel();

        let read_context = context.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read, read_tx, read_context).await;
        });

        Self {
            write: Mutex::new(write),
            read_rx: Mutex::new(read_rx),
            context,
            read_task,
        }
    }

    /// Forward inbound message bodies until the socket closes, then cancel
    /// the session context.
    async fn read_loop(
        mut read: SplitStream<WebSocket>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        context: SessionContext,
    ) {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let _ = tx.send(text.as_bytes().to_vec());
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = tx.send(data.to_vec());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Session websocket closed");
                    break;
                }
                Some(Err(e)) => {
                    debug!("Session websocket error: {e}");
                    break;
                }
            }
        }

        context.cancel("websocket connection closed");
    }

    /// Encode and send one frame.
    pub async fn write(&self, frame: &SessionFrame) -> Result<()> {
        let payload = String::from_utf8(frame.to_json()).expect("frames are valid UTF-8");
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(payload.into()))
            .await
            .context("Failed to write session frame")
    }

    /// Receive the next raw message body; `None` once the socket is gone.
    pub async fn receive(&self) -> Option<Vec<u8>> {
        self.read_rx.lock().await.recv().await
    }

    /// Receive and decode one frame, aborting with the context's cause if
    /// it fires first.
    pub async fn receive_with_context(&self, ctx: &SessionContext) -> Result<SessionFrame> {
        tokio::select! {
            message = self.receive() => {
                let data = message.ok_or_else(|| anyhow!("websocket connection closed"))?;
                match SessionFrame::from_json(&data) {
                    Some(frame) => Ok(frame),
                    None => bail!("Failed to decode session frame"),
                }
            }
            cause = ctx.done() => Err(anyhow!(cause)),
        }
    }

    /// Send a close control frame carrying the error message.
    pub async fn write_close(&self, err: &str) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Close(Some(CloseFrame {
                code: axum::extract::ws::close_code::ERROR,
                reason: err.to_string().into(),
            })))
            .await
            .context("Failed to write close control message")
    }

    /// The session-scoped context: cancelled on socket close, session
    /// timeout or explicit cancel.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }
}

impl Drop for WebsocketGateway {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}
