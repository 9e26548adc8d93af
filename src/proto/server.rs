//! Control-plane server loop.

use std::io::ErrorKind as IoErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::socket::{read_message, write_message};
use super::{CtrlMessage, MessageStatus};
use crate::config;
use crate::error::{Error, Result};

/// A control-plane request handler.
///
/// One request is dispatched at a time; the server serializes calls across
/// all client connections.
pub trait Handler: Send + 'static {
    fn handle(&mut self, msg: CtrlMessage) -> CtrlMessage;
}

impl<F> Handler for F
where
    F: FnMut(CtrlMessage) -> CtrlMessage + Send + 'static,
{
    fn handle(&mut self, msg: CtrlMessage) -> CtrlMessage {
        self(msg)
    }
}

/// A TCP accept loop dispatching control-plane messages to a [`Handler`].
///
/// Each accepted connection is served on its own thread until the peer
/// hangs up or the server is stopped.
pub struct CtrlServer {
    addr: String,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

/// A bound but not yet serving control-plane listener. Splitting bind from
/// serve lets callers learn the actual port of a `:0` bind before the
/// handler needs it.
pub struct BoundCtrl {
    listener: TcpListener,
    addr: String,
}

impl BoundCtrl {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> &str {
        &self.addr
    }

    /// Start dispatching requests to `handler`.
    pub fn serve<H: Handler>(self, handler: H) -> CtrlServer {
        CtrlServer::serve_on(self.listener, self.addr, handler)
    }
}

impl CtrlServer {
    /// Bind `bind_addr` without serving yet.
    pub fn bind(bind_addr: &str) -> Result<BoundCtrl> {
        let listener = TcpListener::bind(bind_addr)
            .map_err(|e| Error::ctrl(format!("cannot bind '{}': {}", bind_addr, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::ctrl(format!("cannot configure listener: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::ctrl(format!("cannot read bound address: {}", e)))?
            .to_string();
        Ok(BoundCtrl { listener, addr })
    }

    /// Bind `bind_addr` and start serving.
    pub fn start<H: Handler>(bind_addr: &str, handler: H) -> Result<Self> {
        Ok(Self::bind(bind_addr)?.serve(handler))
    }

    fn serve_on<H: Handler>(listener: TcpListener, addr: String, handler: H) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(Mutex::new(handler));

        let accept_stop = stop.clone();
        let accept_addr = addr.clone();
        let accept_thread = thread::spawn(move || {
            log::debug!("control-plane server listening on {}", accept_addr);
            let mut conn_threads = Vec::new();
            while !accept_stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        log::debug!("control-plane connection from {}", peer);
                        let handler = handler.clone();
                        let stop = accept_stop.clone();
                        conn_threads.push(thread::spawn(move || {
                            serve_connection(stream, handler, stop);
                        }));
                    }
                    Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(e) => {
                        log::error!("control-plane accept failed: {}", e);
                        break;
                    }
                }
            }
            for t in conn_threads {
                let _ = t.join();
            }
            log::debug!("control-plane server on {} stopped", accept_addr);
        });

        Self {
            addr,
            stop,
            accept_thread: Some(accept_thread),
        }
    }

    /// The address the server is bound to (useful with port 0 binds).
    pub fn local_addr(&self) -> &str {
        &self.addr
    }

    /// Signal the loop to stop and wait for it to wind down.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for CtrlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_connection<H: Handler>(
    mut stream: TcpStream,
    handler: Arc<Mutex<H>>,
    stop: Arc<AtomicBool>,
) {
    // A read timeout lets the thread notice the stop flag even while the
    // peer stays silent.
    let _ = stream.set_read_timeout(Some(config::SLEEP_INTERVAL));

    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let msg = match read_message(&mut stream) {
            Ok(msg) => msg,
            Err(e)
                if e.kind() == IoErrorKind::WouldBlock || e.kind() == IoErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) if e.kind() == IoErrorKind::UnexpectedEof => return,
            Err(e) => {
                log::debug!("control-plane connection dropped: {}", e);
                return;
            }
        };

        let reply = match msg {
            CtrlMessage::NodeIdResponse { .. }
            | CtrlMessage::NodeIdForAddrResponse { .. }
            | CtrlMessage::AllNodeIdsResponse { .. }
            | CtrlMessage::ConnResponse { .. }
            | CtrlMessage::MemoryResponse { .. } => {
                log::warn!("received reply kind {} as a request", msg.kind());
                CtrlMessage::Error {
                    status: MessageStatus::InvalidMessage,
                }
            }
            request => handler.lock().unwrap().handle(request),
        };

        if let Err(e) = write_message(&mut stream, &reply) {
            log::debug!("control-plane reply failed: {}", e);
            return;
        }
    }
}
