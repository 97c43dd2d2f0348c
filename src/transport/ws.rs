//! Secure websocket feed client.
//!
//! One dedicated OS thread per connection hosts a current-thread tokio
//! runtime: the synchronous `connect` spawns it, waits for the handshake
//! result, and returns. TLS uses rustls with webpki roots and SNI from the
//! host name; the upgrade targets `/v2/`.

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{
    report_error, ConnCtl, ConnHandle, ErrorHandler, FeedTransport, MessageHandler,
    DEFAULT_CONNECT_TIMEOUT,
};

/// Websocket upgrade path used by the venue.
pub const WS_TARGET: &str = "/v2/";

pub struct WsFeedClient {
    connect_timeout: Duration,
    message_handler: Mutex<Option<MessageHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    conn: Mutex<Option<ConnHandle>>,
}

impl WsFeedClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            message_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
            conn: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .as_ref()
            .map(|c| c.ctl.is_running())
            .unwrap_or(false)
    }

    fn invoke_error(&self, message: &str) {
        let handler = self.error_handler.lock().clone();
        if let Some(handler) = handler {
            handler(message);
        } else {
            tracing::error!(error = message, "websocket error with no handler installed");
        }
    }
}

impl Default for WsFeedClient {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl FeedTransport for WsFeedClient {
    fn connect(&self, host: &str, port: u16) -> bool {
        if self.is_connected() {
            debug!(host, port, "connect on an already-connected websocket");
            return true;
        }

        let url = format!("wss://{host}:{port}{WS_TARGET}");
        let ctl = ConnCtl::new();
        let (writer_tx, writer_rx) = unbounded_channel::<Vec<u8>>();
        let (result_tx, result_rx) = std_mpsc::channel::<Result<(), String>>();

        let message_handler = self.message_handler.lock().clone();
        let error_handler = self.error_handler.lock().clone();
        let connect_timeout = self.connect_timeout;

        let thread_ctl = ctl.clone();
        let thread_url = url.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("ws-recv-{host}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = result_tx.send(Err(format!("runtime build failed: {e}")));
                        return;
                    }
                };
                rt.block_on(run_connection(
                    thread_url,
                    connect_timeout,
                    thread_ctl,
                    writer_rx,
                    message_handler,
                    error_handler,
                    result_tx,
                ));
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.invoke_error(&format!("websocket connect: thread spawn failed: {e}"));
                return false;
            }
        };

        match result_rx.recv() {
            Ok(Ok(())) => {
                let thread_id = handle.thread().id();
                *self.conn.lock() = Some(ConnHandle {
                    ctl,
                    writer: writer_tx,
                    thread: Some(handle),
                    thread_id,
                });
                true
            }
            Ok(Err(reason)) => {
                let _ = handle.join();
                self.invoke_error(&format!("websocket connect to {url}: {reason}"));
                false
            }
            Err(_) => {
                let _ = handle.join();
                self.invoke_error(&format!("websocket connect to {url}: receive thread died"));
                false
            }
        }
    }

    fn disconnect(&self) {
        let handle = self.conn.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
            info!("websocket disconnected");
        }
    }

    fn send(&self, payload: &[u8]) -> bool {
        let accepted = {
            let conn = self.conn.lock();
            match conn.as_ref() {
                Some(c) if c.ctl.is_running() => c.writer.send(payload.to_vec()).is_ok(),
                _ => false,
            }
        };
        if !accepted {
            self.invoke_error("websocket send on a disconnected transport");
        }
        accepted
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.message_handler.lock() = Some(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.lock() = Some(handler);
    }
}

impl Drop for WsFeedClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_connection(
    url: String,
    connect_timeout: Duration,
    ctl: std::sync::Arc<ConnCtl>,
    mut writer_rx: UnboundedReceiver<Vec<u8>>,
    message_handler: Option<MessageHandler>,
    error_handler: Option<ErrorHandler>,
    result_tx: std_mpsc::Sender<Result<(), String>>,
) {
    let ws_stream = match tokio::time::timeout(connect_timeout, connect_async(&url)).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            let _ = result_tx.send(Err(e.to_string()));
            return;
        }
        Err(_) => {
            let _ = result_tx.send(Err(format!(
                "handshake timed out after {connect_timeout:?}"
            )));
            return;
        }
    };

    info!(url = %url, "websocket connected");
    let _ = result_tx.send(Ok(()));

    let (mut write, mut read) = ws_stream.split();

    while ctl.is_running() {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(handler) = &message_handler {
                            handler(text.as_bytes());
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(handler) = &message_handler {
                            handler(&data);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        report_error(&ctl, &error_handler, "websocket", "closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        report_error(&ctl, &error_handler, "websocket receive", &e.to_string());
                        break;
                    }
                    None => {
                        report_error(&ctl, &error_handler, "websocket", "stream ended");
                        break;
                    }
                }
            }
            outgoing = writer_rx.recv() => {
                match outgoing {
                    Some(bytes) => {
                        let msg = match String::from_utf8(bytes) {
                            Ok(text) => Message::Text(text),
                            Err(e) => Message::Binary(e.into_bytes()),
                        };
                        if let Err(e) = write.send(msg).await {
                            report_error(&ctl, &error_handler, "websocket send", &e.to_string());
                            break;
                        }
                    }
                    None => {
                        warn!("websocket writer channel closed");
                        break;
                    }
                }
            }
            _ = ctl.shutdown.notified() => break,
        }
    }

    ctl.running.store(false, std::sync::atomic::Ordering::Release);
    let _ = write.close().await;
    debug!(url = %url, "websocket receive loop exited");
}
