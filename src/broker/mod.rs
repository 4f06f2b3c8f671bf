//! Broker — the single-threaded event loop that owns every stream's I/O.
//!
//! See spec §4.4 and §5. Exactly one thread per process ever touches a
//! stream's socket for reading or writing: this one. Every other thread
//! (callers blocked in `Context::call_with_deadline`, embedder code
//! enqueuing frames) only ever appends to a stream's output buffer and
//! wakes the broker up; the broker itself does all `Poll::poll`,
//! `accept`, `read`, and `write` calls.
//!
//! Registration of a new stream happens via [`Broker::register_stream`],
//! which may be called from any thread: it stashes the new stream in a
//! pending queue and signals the loop's [`mio::Waker`], mirroring the
//! wake-pipe design described in spec §4.4 ("Enqueue … wakes the
//! broker"). Accepting an inbound data connection (spec §4.4, a child
//! context reconnecting after bootstrap) is handed off to an
//! `on_accept` callback supplied at [`Broker::spawn`] time — the broker
//! itself only knows sockets and tokens, not context identity or keys.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::stream::Stream;

/// Token identifying one registered stream in the broker's `mio::Poll`
/// registry.
pub type StreamToken = Token;

const WAKER_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const FIRST_STREAM_TOKEN: usize = 2;

/// Broker startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("failed to initialise mio::Poll: {0}")]
    PollInit(io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

type RegisterCallback = Box<dyn FnOnce(io::Result<()>) + Send>;

enum PendingOp {
    Register {
        stream: Arc<Stream>,
        callback: RegisterCallback,
    },
    RequestWritable(StreamToken),
    Shutdown,
}

/// A callback invoked on the broker's own thread whenever the listener
/// accepts a connection. Receives the raw socket and peer address; it
/// is responsible for wrapping it in a [`Stream`] (once it knows which
/// context's key applies) and calling [`Broker::register_stream`].
pub type AcceptCallback = Arc<dyn Fn(MioTcpStream, SocketAddr, Weak<Broker>) + Send + Sync>;

/// The broker. Holds the `mio::Poll` registry, the listener (if any),
/// and the live set of registered streams, keyed by token.
///
/// Callers interact with a running broker only through the handle
/// methods ([`Broker::register_stream`], [`Broker::request_writable`]);
/// the loop itself runs on a dedicated thread started by [`Broker::spawn`].
pub struct Broker {
    waker: Waker,
    pending: Mutex<Vec<PendingOp>>,
    next_token: AtomicUsize,
    running: AtomicBool,
    listen_addr: Option<SocketAddr>,
}

/// A running broker's join handle, returned by [`Broker::spawn`].
pub struct BrokerHandle {
    pub broker: Arc<Broker>,
    join: JoinHandle<Result<(), BrokerError>>,
}

impl BrokerHandle {
    /// Ask the loop thread to exit and wait for it to do so.
    pub fn shutdown(self) -> Result<(), BrokerError> {
        self.broker.pending.lock().push(PendingOp::Shutdown);
        let _ = self.broker.waker.wake();
        self.join.join().expect("broker thread panicked")
    }

    /// The address this broker's listener was actually bound to (useful
    /// when `listen_addr` was passed with an ephemeral port). `None` if
    /// the broker was started without a listener.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.broker.listen_addr
    }
}

impl Broker {
    /// Start the broker's event loop on a new thread, optionally
    /// listening for inbound connections on `listen_addr` (spec §4.4,
    /// used by a controller accepting child contexts' data connections).
    pub fn spawn(
        listen_addr: Option<SocketAddr>,
        on_accept: Option<AcceptCallback>,
    ) -> Result<BrokerHandle, BrokerError> {
        let poll = Poll::new().map_err(BrokerError::PollInit)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(BrokerError::PollInit)?;

        let mut bound_addr = None;
        let listener = match listen_addr {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)
                    .map_err(|source| BrokerError::Bind { addr, source })?;
                bound_addr = Some(listener.local_addr().map_err(BrokerError::PollInit)?);
                poll.registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
                    .map_err(BrokerError::PollInit)?;
                Some(listener)
            }
            None => None,
        };

        let broker = Arc::new(Broker {
            waker,
            pending: Mutex::new(Vec::new()),
            next_token: AtomicUsize::new(FIRST_STREAM_TOKEN),
            running: AtomicBool::new(true),
            listen_addr: bound_addr,
        });

        let loop_broker = broker.clone();
        let join = std::thread::Builder::new()
            .name("remctx-broker".into())
            .spawn(move || run_loop(loop_broker, poll, listener, on_accept))
            .expect("failed to spawn broker thread");

        Ok(BrokerHandle { broker, join })
    }

    /// Allocate the next stream token. Exposed so `register_stream`
    /// callers can construct a [`Stream`] (which needs its token up
    /// front) before handing it to the broker.
    pub fn next_token(&self) -> StreamToken {
        Token(self.next_token.fetch_add(1, Ordering::SeqCst))
    }

    /// Hand a newly constructed stream to the broker for registration
    /// with the poll registry. Safe to call from any thread.
    pub fn register_stream(
        self: &Arc<Self>,
        stream: Arc<Stream>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) {
        self.pending.lock().push(PendingOp::Register {
            stream,
            callback: Box::new(callback),
        });
        let _ = self.waker.wake();
    }

    /// Ask the loop to watch `token` for writability on its next pass.
    /// Called by [`Stream::enqueue`] from any thread.
    pub fn request_writable(&self, token: StreamToken) {
        self.pending.lock().push(PendingOp::RequestWritable(token));
        let _ = self.waker.wake();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

fn run_loop(
    broker: Arc<Broker>,
    mut poll: Poll,
    mut listener: Option<TcpListener>,
    on_accept: Option<AcceptCallback>,
) -> Result<(), BrokerError> {
    let mut events = Events::with_capacity(128);
    let mut streams: HashMap<Token, Arc<Stream>> = HashMap::new();
    let mut writable_wanted: HashMap<Token, ()> = HashMap::new();
    let weak_broker = Arc::downgrade(&broker);

    'outer: loop {
        poll.poll(&mut events, Some(Duration::from_millis(200)))?;

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => { /* drained in the pending-ops pass below */ }
                LISTENER_TOKEN => {
                    if let (Some(listener), Some(on_accept)) = (listener.as_mut(), &on_accept) {
                        accept_loop(listener, on_accept, &weak_broker);
                    }
                }
                token => {
                    let Some(stream) = streams.get(&token).cloned() else {
                        continue;
                    };
                    if event.is_readable() {
                        if let Err(e) = stream.receive_once() {
                            tracing::debug!(?token, error = %e, "stream read failed, disconnecting");
                            stream.disconnect();
                            streams.remove(&token);
                            continue;
                        }
                    }
                    if event.is_writable() {
                        match stream.transmit_once() {
                            Ok(pending) => {
                                if !pending {
                                    writable_wanted.remove(&token);
                                    reregister_readable(&poll, stream.as_ref(), token);
                                }
                            }
                            Err(e) => {
                                tracing::debug!(?token, error = %e, "stream write failed, disconnecting");
                                stream.disconnect();
                                streams.remove(&token);
                            }
                        }
                    }
                    if event.is_read_closed() || event.is_write_closed() {
                        stream.disconnect();
                        streams.remove(&token);
                    }
                }
            }
        }

        let ops: Vec<PendingOp> = std::mem::take(&mut *broker.pending.lock());
        for op in ops {
            match op {
                PendingOp::Register { stream, callback } => {
                    let token = stream.token();
                    let result = register_for_read(&poll, stream.as_ref(), token);
                    if result.is_ok() {
                        streams.insert(token, stream);
                    }
                    callback(result);
                }
                PendingOp::RequestWritable(token) => {
                    if let Some(stream) = streams.get(&token) {
                        if writable_wanted.insert(token, ()).is_none() {
                            reregister_readable_writable(&poll, stream.as_ref(), token);
                        }
                    }
                }
                PendingOp::Shutdown => {
                    broker.running.store(false, Ordering::Release);
                    for stream in streams.values() {
                        stream.disconnect();
                    }
                    break 'outer;
                }
            }
        }
    }

    Ok(())
}

fn accept_loop(listener: &mut TcpListener, on_accept: &AcceptCallback, broker: &Weak<Broker>) {
    loop {
        match listener.accept() {
            Ok((io, peer)) => {
                tracing::debug!(%peer, "accepted data connection");
                on_accept(io, peer, broker.clone());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

fn register_for_read(poll: &Poll, stream: &Stream, token: Token) -> io::Result<()> {
    stream.with_io_source(|io| poll.registry().register(io, token, Interest::READABLE))
}

fn reregister_readable(poll: &Poll, stream: &Stream, token: Token) {
    let _ = stream.with_io_source(|io| poll.registry().reregister(io, token, Interest::READABLE));
}

fn reregister_readable_writable(poll: &Poll, stream: &Stream, token: Token) {
    let _ = stream.with_io_source(|io| {
        poll.registry()
            .reregister(io, token, Interest::READABLE | Interest::WRITABLE)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_shutdown_cleanly() {
        let handle = Broker::spawn(None, None).unwrap();
        handle.shutdown().unwrap();
    }

    #[test]
    fn tokens_are_monotonically_allocated() {
        let handle = Broker::spawn(None, None).unwrap();
        let a = handle.broker.next_token();
        let b = handle.broker.next_token();
        assert_ne!(a, b);
        handle.shutdown().unwrap();
    }
}
