//! Persistent TCP feed client speaking the FIX 4.4 subset.
//!
//! The receive loop fills an 8 KiB buffer and appends to a sliding buffer;
//! whole records (terminated by `10=NNN<SOH>`) are peeled off the front and
//! partial tails wait for the next read. On connection ready the client sends
//! a logon; once the counterparty's logon ack is observed (one-shot per
//! connection) it requests market data for the subscribed symbol. The logon
//! ack itself is consumed here and never reaches the message handler.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};

use super::fixwire::{
    build_record, find_record_end, is_logon_ack, logon_body, market_data_request_body,
    MSG_TYPE_LOGON, MSG_TYPE_MARKET_DATA_REQUEST,
};
use super::{
    report_error, ConnCtl, ConnHandle, ErrorHandler, FeedTransport, MessageHandler,
    DEFAULT_CONNECT_TIMEOUT, RECV_BUFFER_SIZE,
};
use crate::config::FixSessionConfig;

pub struct FixFeedClient {
    connect_timeout: Duration,
    session: FixSessionConfig,
    symbol: String,
    message_handler: Mutex<Option<MessageHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    conn: Mutex<Option<ConnHandle>>,
    /// Outgoing 34= sequence; starts at 1 and resets per connection.
    seq: Arc<AtomicU32>,
    /// 262= request id counter; monotonic for the client's lifetime.
    request_counter: Arc<AtomicU32>,
}

impl FixFeedClient {
    pub fn new(session: FixSessionConfig, symbol: impl Into<String>) -> Self {
        Self::with_timeout(session, symbol, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(
        session: FixSessionConfig,
        symbol: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connect_timeout,
            session,
            symbol: symbol.into(),
            message_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
            conn: Mutex::new(None),
            seq: Arc::new(AtomicU32::new(1)),
            request_counter: Arc::new(AtomicU32::new(1)),
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
            tracing::error!(error = message, "fix transport error with no handler installed");
        }
    }
}

impl FeedTransport for FixFeedClient {
    fn connect(&self, host: &str, port: u16) -> bool {
        if self.is_connected() {
            debug!(host, port, "connect on an already-connected fix session");
            return true;
        }

        let ctl = ConnCtl::new();
        let (writer_tx, writer_rx) = unbounded_channel::<Vec<u8>>();
        let (result_tx, result_rx) = std_mpsc::channel::<Result<(), String>>();

        let params = ConnParams {
            host: host.to_string(),
            port,
            connect_timeout: self.connect_timeout,
            session: self.session.clone(),
            symbol: self.symbol.clone(),
            seq: Arc::clone(&self.seq),
            request_counter: Arc::clone(&self.request_counter),
            message_handler: self.message_handler.lock().clone(),
            error_handler: self.error_handler.lock().clone(),
        };

        let thread_ctl = ctl.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("fix-recv-{host}"))
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
                rt.block_on(run_connection(params, thread_ctl, writer_rx, result_tx));
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.invoke_error(&format!("fix connect: thread spawn failed: {e}"));
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
                self.invoke_error(&format!("fix connect to {host}:{port}: {reason}"));
                false
            }
            Err(_) => {
                let _ = handle.join();
                self.invoke_error(&format!("fix connect to {host}:{port}: receive thread died"));
                false
            }
        }
    }

    fn disconnect(&self) {
        let handle = self.conn.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
            // Sequence numbering restarts on the next session.
            self.seq.store(1, Ordering::Release);
            info!("fix session disconnected");
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
            self.invoke_error("fix send on a disconnected transport");
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

impl Drop for FixFeedClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct ConnParams {
    host: String,
    port: u16,
    connect_timeout: Duration,
    session: FixSessionConfig,
    symbol: String,
    seq: Arc<AtomicU32>,
    request_counter: Arc<AtomicU32>,
    message_handler: Option<MessageHandler>,
    error_handler: Option<ErrorHandler>,
}

async fn run_connection(
    params: ConnParams,
    ctl: Arc<ConnCtl>,
    mut writer_rx: UnboundedReceiver<Vec<u8>>,
    result_tx: std_mpsc::Sender<Result<(), String>>,
) {
    let addr = (params.host.as_str(), params.port);
    let mut stream = match tokio::time::timeout(params.connect_timeout, TcpStream::connect(addr))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = result_tx.send(Err(e.to_string()));
            return;
        }
        Err(_) => {
            let _ = result_tx.send(Err(format!(
                "connect timed out after {:?}",
                params.connect_timeout
            )));
            return;
        }
    };

    info!(host = %params.host, port = params.port, "fix session connected");
    let _ = result_tx.send(Ok(()));

    let (mut rd, mut wr) = stream.split();

    // Connection ready: fresh sequence, fresh logon state, send the logon.
    params.seq.store(1, Ordering::Release);
    let logged_on = AtomicBool::new(false);
    let next_seq = || params.seq.fetch_add(1, Ordering::Relaxed);

    let logon = build_record(
        MSG_TYPE_LOGON,
        next_seq(),
        &params.session.sender_comp_id,
        &params.session.target_comp_id,
        &logon_body(params.session.heartbeat_secs),
    );
    info!("sending fix logon");
    if let Err(e) = wr.write_all(&logon).await {
        report_error(&ctl, &params.error_handler, "fix logon send", &e.to_string());
        ctl.running.store(false, Ordering::Release);
        return;
    }

    let mut recv_buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut sliding: Vec<u8> = Vec::with_capacity(RECV_BUFFER_SIZE * 2);

    while ctl.is_running() {
        tokio::select! {
            read = rd.read(&mut recv_buf) => {
                match read {
                    Ok(0) => {
                        report_error(&ctl, &params.error_handler, "fix receive", "connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        sliding.extend_from_slice(&recv_buf[..n]);
                        while let Some(end) = find_record_end(&sliding) {
                            let is_ack = {
                                let record = &sliding[..end];
                                is_logon_ack(
                                    record,
                                    &params.session.sender_comp_id,
                                    &params.session.target_comp_id,
                                )
                            };
                            if is_ack && !logged_on.swap(true, Ordering::AcqRel) {
                                info!(symbol = %params.symbol, "logon acknowledged, requesting market data");
                                let request_id =
                                    params.request_counter.fetch_add(1, Ordering::Relaxed);
                                let request = build_record(
                                    MSG_TYPE_MARKET_DATA_REQUEST,
                                    next_seq(),
                                    &params.session.sender_comp_id,
                                    &params.session.target_comp_id,
                                    &market_data_request_body(request_id, &params.symbol),
                                );
                                if let Err(e) = wr.write_all(&request).await {
                                    report_error(
                                        &ctl,
                                        &params.error_handler,
                                        "fix market-data request send",
                                        &e.to_string(),
                                    );
                                }
                            } else if let Some(handler) = &params.message_handler {
                                handler(&sliding[..end]);
                            }
                            sliding.drain(..end);
                        }
                    }
                    Err(e) => {
                        report_error(&ctl, &params.error_handler, "fix receive", &e.to_string());
                        break;
                    }
                }
            }
            outgoing = writer_rx.recv() => {
                match outgoing {
                    Some(bytes) => {
                        if let Err(e) = wr.write_all(&bytes).await {
                            report_error(&ctl, &params.error_handler, "fix send", &e.to_string());
                            break;
                        }
                    }
                    None => {
                        warn!("fix writer channel closed");
                        break;
                    }
                }
            }
            _ = ctl.shutdown.notified() => break,
        }
    }

    ctl.running.store(false, Ordering::Release);
    debug!(host = %params.host, "fix receive loop exited");
}
