//! Stream — the framed transport over one file descriptor.
//!
//! See spec §4.3. One `Stream` owns one socket exclusively. `handle_map`
//! is mutated under a lock; handles are a monotonically increasing
//! 64-bit counter allocated per-stream, with `0` (`GET_MODULE`) and `1`
//! (`CALL_FUNCTION`) reserved (spec §3, §6).
//!
//! Per spec §5, the broker's loop thread is the *only* thread that ever
//! calls [`Stream::receive_once`] or [`Stream::transmit_once`]. Any
//! thread may call [`Stream::enqueue`]; it only appends to the output
//! buffer under a lock and asks the broker to watch the socket for
//! writability.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Weak;

use bytes::BytesMut;
use hmac::Hmac;
use mio::net::TcpStream;
use parking_lot::Mutex;
use sha1::Sha1;

use crate::broker::{Broker, StreamToken};
use crate::error::CorruptFrameError;
use crate::marshal::RemoteValue;
use crate::wire::{self, Handle};

/// Default chunk size for a single `read`/`write` syscall per poll
/// iteration (spec §4.3 "bounded chunk").
const IO_CHUNK: usize = 4096;
/// Ceiling on a single frame's payload length, shared with [`crate::wire`].
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Lifecycle state of a [`Stream`]. Disconnect is terminal and
/// idempotent; there is no reconnect (spec §4.3, Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StreamState::Connecting,
            1 => StreamState::Connected,
            _ => StreamState::Disconnected,
        }
    }
}

/// A callback installed on a handle. Invoked by the broker thread with
/// `(closed_or_lost, body)` — see spec §4.3 `Receive`/`Disconnect`.
pub type HandleCallback = Box<dyn FnMut(bool, RemoteValue) + Send>;

struct HandleEntry {
    persist: bool,
    callback: HandleCallback,
}

/// The framed transport over one socket. See module docs.
pub struct Stream {
    id: u64,
    io: Mutex<TcpStream>,
    token: StreamToken,
    input_buf: Mutex<BytesMut>,
    output_buf: Mutex<Vec<u8>>,
    read_mac: Mutex<Hmac<Sha1>>,
    write_mac: Mutex<Hmac<Sha1>>,
    last_handle: AtomicU64,
    handle_map: Mutex<HashMap<Handle, HandleEntry>>,
    state: AtomicU8,
    broker: Weak<Broker>,
}

impl Stream {
    /// Construct a stream wrapping an already-connected socket. `key` is
    /// the context's shared secret, used to seed both MAC directions
    /// (spec §4.1).
    pub fn new(
        id: u64,
        io: TcpStream,
        token: StreamToken,
        key: &[u8],
        broker: Weak<Broker>,
    ) -> Self {
        Self {
            id,
            io: Mutex::new(io),
            token,
            input_buf: Mutex::new(BytesMut::new()),
            output_buf: Mutex::new(Vec::new()),
            read_mac: Mutex::new(wire::new_mac_state(key)),
            write_mac: Mutex::new(wire::new_mac_state(key)),
            last_handle: AtomicU64::new(2), // 0, 1, and 2 are reserved.
            handle_map: Mutex::new(HashMap::new()),
            state: AtomicU8::new(StreamState::Connecting as u8),
            broker,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> StreamToken {
        self.token
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn mark_connected(&self) {
        self.state
            .store(StreamState::Connected as u8, Ordering::Release);
    }

    /// Allocate a fresh handle, unique for the lifetime of this stream
    /// (spec invariant #3).
    pub fn alloc_handle(&self) -> Handle {
        self.last_handle.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Install `callback` for `handle`. `persist = false` means the
    /// entry is removed after its first invocation. A duplicate install
    /// overwrites the existing entry (spec §4.3).
    pub fn add_handle_cb(&self, handle: Handle, persist: bool, callback: HandleCallback) {
        self.handle_map
            .lock()
            .insert(handle, HandleEntry { persist, callback });
    }

    /// Marshal `body`, frame it, append to the output buffer, and ask
    /// the broker to watch this stream for writability. Safe to call
    /// from any thread (spec §4.3, §5).
    pub fn enqueue(&self, handle: Handle, body: RemoteValue) -> Result<(), CorruptFrameError> {
        let framed = {
            let mut mac = self.write_mac.lock();
            wire::encode_frame(&mut mac, handle, body)?
        };
        {
            let mut out = self.output_buf.lock();
            out.extend_from_slice(&framed);
        }
        if let Some(broker) = self.broker.upgrade() {
            broker.request_writable(self.token);
        }
        Ok(())
    }

    /// Broker-only: read as much as is available (bounded per call),
    /// drain every complete frame, and invoke its callback. Returns
    /// `Err` on a corrupt frame or I/O failure — fatal for the stream.
    pub fn receive_once(&self) -> Result<(), StreamIoError> {
        loop {
            let mut chunk = [0u8; IO_CHUNK];
            let n = {
                let mut io = self.io.lock();
                match io.read(&mut chunk) {
                    Ok(0) => return Err(StreamIoError::Eof),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(StreamIoError::Io(e)),
                }
            };
            self.input_buf.lock().extend_from_slice(&chunk[..n]);
        }
        self.drain_frames()
    }

    fn drain_frames(&self) -> Result<(), StreamIoError> {
        loop {
            let mut input = self.input_buf.lock();
            let decoded = {
                let mut mac = self.read_mac.lock();
                wire::try_decode_frame(&mut input, &mut mac, MAX_FRAME_LEN)
            };
            drop(input);

            let (handle, body) = match decoded {
                Ok(Some(pair)) => pair,
                Ok(None) => return Ok(()),
                Err(e) => return Err(StreamIoError::Corrupt(e)),
            };

            let mut map = self.handle_map.lock();
            let persist = match map.get(&handle) {
                Some(entry) => entry.persist,
                None => {
                    return Err(StreamIoError::Corrupt(CorruptFrameError::UnknownHandle(
                        handle,
                    )));
                }
            };

            if persist {
                let entry = map.get_mut(&handle).expect("checked above");
                (entry.callback)(false, body);
            } else {
                let mut entry = map.remove(&handle).expect("checked above");
                drop(map);
                (entry.callback)(false, body);
            }
        }
    }

    /// Broker-only: write a bounded chunk from the output buffer.
    /// Returns whether data remains buffered afterward.
    pub fn transmit_once(&self) -> Result<bool, io::Error> {
        loop {
            let chunk = {
                let out = self.output_buf.lock();
                if out.is_empty() {
                    return Ok(false);
                }
                let take = out.len().min(IO_CHUNK);
                out[..take].to_vec()
            };
            let written = {
                let mut io = self.io.lock();
                match io.write(&chunk) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            if written == 0 {
                return Ok(true);
            }
            let mut out = self.output_buf.lock();
            out.drain(..written);
            return Ok(!out.is_empty());
        }
    }

    /// Close the socket and synthesise a closed signal on every live
    /// handle (spec §4.3, invariant #4). Idempotent.
    pub fn disconnect(&self) {
        let was_connected = self
            .state
            .swap(StreamState::Disconnected as u8, Ordering::AcqRel)
            != StreamState::Disconnected as u8;
        if !was_connected {
            return;
        }
        {
            let io = self.io.lock();
            let _ = io.shutdown(Shutdown::Both);
        }
        let mut map = self.handle_map.lock();
        for (_, mut entry) in map.drain() {
            (entry.callback)(true, RemoteValue::Unit);
        }
    }

    pub fn is_output_pending(&self) -> bool {
        !self.output_buf.lock().is_empty()
    }

    /// Broker-only: borrow the underlying `mio::net::TcpStream` to
    /// (re)register it with a `Poll` registry.
    pub fn with_io_source<R>(&self, f: impl FnOnce(&mut TcpStream) -> io::Result<R>) -> io::Result<R> {
        let mut io = self.io.lock();
        f(&mut io)
    }
}

/// Failure surfaced from [`Stream::receive_once`]/[`Stream::transmit_once`],
/// always handled by the broker disconnecting the stream (spec §4.4, §7).
#[derive(Debug, thiserror::Error)]
pub enum StreamIoError {
    #[error("stream reached EOF")]
    Eof,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt frame: {0}")]
    Corrupt(#[from] CorruptFrameError),
}
