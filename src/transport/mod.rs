//! Venue transports: a secure websocket client and a persistent TCP client
//! behind one contract.
//!
//! Both clients follow the same lifecycle: `connect` resolves and performs
//! the protocol handshake synchronously, then spawns exactly one receive
//! thread which hosts a current-thread tokio runtime for the life of the
//! connection. Callbacks are installed before `connect` and read by the
//! receive thread without further locking. `disconnect` is idempotent and
//! detaches instead of joining when invoked from the receive thread itself.

pub mod fixwire;
pub mod tcp;
pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::debug;

pub use tcp::FixFeedClient;
pub use ws::WsFeedClient;

/// Invoked by the receive thread with one complete message/record.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Invoked on connect/handshake/receive/send failures.
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Default connect timeout; configurable per transport.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive buffer size for the TCP read loop.
pub const RECV_BUFFER_SIZE: usize = 8192;

/// Common contract over the two transport variants.
pub trait FeedTransport {
    /// Synchronous connect; spawns the receive thread on success. Failure
    /// invokes the error handler and returns `false`.
    fn connect(&self, host: &str, port: u16) -> bool;

    /// Idempotent shutdown; joins the receive thread unless called from it.
    fn disconnect(&self);

    /// Hand one outgoing frame/record to the connection. `false` when the
    /// transport is down (the error handler is invoked).
    fn send(&self, payload: &[u8]) -> bool;

    /// Install the message callback. Must be called before `connect`.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Install the error callback. Must be called before `connect`.
    fn set_error_handler(&self, handler: ErrorHandler);
}

/// Tag used by the obtainer to select the venue parser at construction time;
/// no runtime dispatch on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Fix,
}

/// The two concrete transports as one owned value.
pub enum Transport {
    WebSocket(WsFeedClient),
    Fix(FixFeedClient),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::WebSocket(_) => TransportKind::WebSocket,
            Transport::Fix(_) => TransportKind::Fix,
        }
    }
}

impl FeedTransport for Transport {
    fn connect(&self, host: &str, port: u16) -> bool {
        match self {
            Transport::WebSocket(c) => c.connect(host, port),
            Transport::Fix(c) => c.connect(host, port),
        }
    }

    fn disconnect(&self) {
        match self {
            Transport::WebSocket(c) => c.disconnect(),
            Transport::Fix(c) => c.disconnect(),
        }
    }

    fn send(&self, payload: &[u8]) -> bool {
        match self {
            Transport::WebSocket(c) => c.send(payload),
            Transport::Fix(c) => c.send(payload),
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        match self {
            Transport::WebSocket(c) => c.set_message_handler(handler),
            Transport::Fix(c) => c.set_message_handler(handler),
        }
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        match self {
            Transport::WebSocket(c) => c.set_error_handler(handler),
            Transport::Fix(c) => c.set_error_handler(handler),
        }
    }
}

/// Per-connection control block shared between the owning client and its
/// receive thread.
pub(crate) struct ConnCtl {
    pub running: AtomicBool,
    pub shutdown: Notify,
}

impl ConnCtl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        })
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Handle to a live connection: control block, outgoing frame channel and the
/// receive thread itself.
pub(crate) struct ConnHandle {
    pub ctl: Arc<ConnCtl>,
    pub writer: UnboundedSender<Vec<u8>>,
    pub thread: Option<JoinHandle<()>>,
    pub thread_id: ThreadId,
}

impl ConnHandle {
    /// Stop the connection and reap the receive thread. When the caller *is*
    /// the receive thread (error callback path) the thread is detached to
    /// avoid a self-join.
    pub fn shutdown(mut self) {
        self.ctl.running.store(false, Ordering::Release);
        self.ctl.shutdown.notify_one();

        if let Some(handle) = self.thread.take() {
            if self.thread_id == std::thread::current().id() {
                debug!("disconnect from receive thread, detaching");
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
    }
}

/// Shared error-reporting shim: swallow cancellation-shaped errors during
/// shutdown, forward everything else to the installed handler.
pub(crate) fn report_error(
    ctl: &ConnCtl,
    handler: &Option<ErrorHandler>,
    context: &str,
    error: &str,
) {
    if !ctl.is_running() {
        debug!(context, error, "error after shutdown, swallowed");
        return;
    }
    if let Some(handler) = handler {
        handler(&format!("{context}: {error}"));
    } else {
        tracing::error!(context, error, "transport error with no handler installed");
    }
}
