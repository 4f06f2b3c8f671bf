//! Channel — a persistent, bidirectional, handle-addressed queue layered
//! on top of a [`Stream`].
//!
//! See spec §4.6. Unlike a call's reply handle (removed after one
//! delivery), a channel's handle callback persists for the channel's
//! whole life: every `(closed, data)` pair it receives is pushed onto an
//! internal queue, and a condvar wakes any thread blocked in
//! [`Channel::receive`]. `Close` is a one-way signal to the remote side;
//! receiving a stream disconnect is folded into the same "closed" state
//! so callers see one uniform termination path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::ChannelError;
use crate::marshal::RemoteValue;
use crate::wire::Handle;
use crate::stream::Stream;

struct Inner {
    queue: VecDeque<(bool, RemoteValue)>,
}

/// A channel bound to one handle on one stream.
pub struct Channel {
    stream: Arc<Stream>,
    handle: Handle,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Channel {
    /// Open a channel on `handle` of `stream`. `handle` is typically
    /// allocated via [`Stream::alloc_handle`] beforehand; the two sides
    /// must agree on it out of band (e.g. as part of a call's arguments).
    pub fn new(stream: Arc<Stream>, handle: Handle) -> Arc<Self> {
        let channel = Arc::new(Channel {
            stream: stream.clone(),
            handle,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
            }),
            wake: Condvar::new(),
        });

        let weak = Arc::downgrade(&channel);
        stream.add_handle_cb(
            handle,
            true,
            Box::new(move |stream_lost, body| {
                if let Some(channel) = weak.upgrade() {
                    channel.on_receive(stream_lost, body);
                }
            }),
        );
        channel
    }

    fn on_receive(&self, stream_lost: bool, body: RemoteValue) {
        let (closed, data) = if stream_lost {
            (true, RemoteValue::Unit)
        } else {
            unwrap_envelope(body)
        };
        let mut inner = self.inner.lock();
        inner.queue.push_back((closed, data));
        self.wake.notify_all();
    }

    /// Tell the remote side this channel is closed (spec §4.6). Does
    /// not affect the local read queue — any already-queued data is
    /// still deliverable via [`Channel::receive`].
    pub fn close(&self) -> Result<(), crate::error::StreamError> {
        self.stream
            .enqueue(self.handle, RemoteValue::Seq(vec![RemoteValue::Bool(true), RemoteValue::Unit]))
            .map_err(Into::into)
    }

    /// Send `data` to the remote side of this channel.
    pub fn send(&self, data: RemoteValue) -> Result<(), crate::error::StreamError> {
        self.stream
            .enqueue(self.handle, RemoteValue::Seq(vec![RemoteValue::Bool(false), data]))
            .map_err(Into::into)
    }

    /// Block for up to `timeout` (or forever if `None`) for the next
    /// item. Returns `Err(ChannelError::Closed)` once the remote side
    /// has closed the channel or the owning stream has disconnected and
    /// the queue has drained. A deadline elapsing with nothing queued is
    /// benign and returns `Err(ChannelError::Timeout)` — the channel is
    /// left healthy and a later call may still succeed.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<RemoteValue, ChannelError> {
        let mut inner = self.inner.lock();
        let deadline = timeout.map(|d| Instant::now() + d);

        loop {
            if let Some((closed, data)) = inner.queue.pop_front() {
                return if closed {
                    Err(ChannelError::Closed)
                } else {
                    Ok(data)
                };
            }
            match deadline {
                None => self.wake.wait(&mut inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ChannelError::Timeout);
                    }
                    let timed_out = self
                        .wake
                        .wait_for(&mut inner, deadline - now)
                        .timed_out();
                    if timed_out && inner.queue.is_empty() {
                        return Err(ChannelError::Timeout);
                    }
                }
            }
        }
    }

    /// Drain every queued item, then stop. Mirrors the source's
    /// generator-based `__iter__`, terminating cleanly on `ChannelError`.
    pub fn iter(self: &Arc<Self>) -> ChannelIter {
        ChannelIter {
            channel: self.clone(),
        }
    }
}

fn unwrap_envelope(body: RemoteValue) -> (bool, RemoteValue) {
    match body {
        RemoteValue::Seq(mut items) if items.len() == 2 => {
            let data = items.pop().unwrap();
            let closed = matches!(items.pop(), Some(RemoteValue::Bool(true)));
            (closed, data)
        }
        other => (false, other),
    }
}

/// Blocking iterator over a [`Channel`]'s inbound items.
pub struct ChannelIter {
    channel: Arc<Channel>,
}

impl Iterator for ChannelIter {
    type Item = RemoteValue;

    fn next(&mut self) -> Option<RemoteValue> {
        self.channel.receive(None).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StreamToken;
    use mio::net::TcpStream;
    use std::net::TcpListener as StdListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), TcpStream::from_std(client))
    }

    fn make_stream(io: TcpStream, key: &[u8]) -> Arc<Stream> {
        Arc::new(Stream::new(1, io, StreamToken(1), key, std::sync::Weak::new()))
    }

    #[test]
    fn send_then_receive_round_trips() {
        let (a, b) = connected_pair();
        let key = b"sharedkey";
        let sa = make_stream(a, key);
        let sb = make_stream(b, key);

        let handle = 9;
        let chan_a = Channel::new(sa.clone(), handle);
        let chan_b = Channel::new(sb.clone(), handle);

        chan_a.send(RemoteValue::Str("hi".into())).unwrap();
        while sa.transmit_once().unwrap() {}
        std::thread::sleep(Duration::from_millis(20));
        sb.receive_once().unwrap();

        assert_eq!(
            chan_b.receive(Some(Duration::from_secs(1))).unwrap(),
            RemoteValue::Str("hi".into())
        );
    }

    #[test]
    fn close_then_receive_is_closed_error() {
        let (a, b) = connected_pair();
        let key = b"sharedkey";
        let sa = make_stream(a, key);
        let sb = make_stream(b, key);

        let handle = 9;
        let chan_a = Channel::new(sa.clone(), handle);
        let chan_b = Channel::new(sb.clone(), handle);
        let _ = &chan_a;

        chan_a.close().unwrap();
        while sa.transmit_once().unwrap() {}
        std::thread::sleep(Duration::from_millis(20));
        sb.receive_once().unwrap();

        assert_eq!(
            chan_b.receive(Some(Duration::from_secs(1))),
            Err(ChannelError::Closed)
        );
    }

    #[test]
    fn receive_times_out_when_nothing_arrives() {
        let (a, _b) = connected_pair();
        let sa = make_stream(a, b"key");
        let chan = Channel::new(sa, 9);
        let err = chan.receive(Some(Duration::from_millis(30))).unwrap_err();
        assert_eq!(err, ChannelError::Timeout);
    }

    #[test]
    fn receive_times_out_then_later_receive_still_works() {
        let (a, b) = connected_pair();
        let key = b"sharedkey";
        let sa = make_stream(a, key);
        let sb = make_stream(b, key);

        let handle = 9;
        let chan_a = Channel::new(sa.clone(), handle);
        let chan_b = Channel::new(sb.clone(), handle);

        let err = chan_b.receive(Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err, ChannelError::Timeout);

        chan_a.send(RemoteValue::Int(7)).unwrap();
        while sa.transmit_once().unwrap() {}
        std::thread::sleep(Duration::from_millis(20));
        sb.receive_once().unwrap();

        assert_eq!(
            chan_b.receive(Some(Duration::from_secs(1))).unwrap(),
            RemoteValue::Int(7)
        );
    }
}
