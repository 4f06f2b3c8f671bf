//! Context — a logical peer: a name, a key, and the stream that reaches it.
//!
//! See spec §4.5. A `Context` doesn't own I/O itself; it owns a
//! [`Stream`] and exposes the two caller-facing blocking operations the
//! rest of the runtime is built around: [`Context::call_with_deadline`]
//! (request/reply) and [`Context::call`] (its no-deadline convenience
//! wrapper). Fire-and-forget sends go through a [`crate::channel::Channel`]
//! instead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{ContextError, RemoteException, TimeoutError};
use crate::marshal::{FuncTable, LocalCallable, RemoteValue};
use crate::stream::Stream;
use crate::wire::{Handle, CALL_FUNCTION, CALL_FUNC_REF};

/// A remote call's target: the `(module, function)` pair the spec's
/// wire body names (spec §4.5, §6). Embedders resolve this against a
/// [`crate::registry::FunctionRegistry`] on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FnRef {
    pub module_name: String,
    pub func_name: String,
}

impl FnRef {
    pub fn new(module_name: impl Into<String>, func_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            func_name: func_name.into(),
        }
    }
}

struct PendingCall {
    done: bool,
    lost: bool,
    result: Option<RemoteValue>,
}

/// A logical peer reachable over a [`Stream`].
pub struct Context {
    pub name: String,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub key: Vec<u8>,
    pub parent_addr: Option<std::net::SocketAddr>,
    stream: Mutex<Option<Arc<Stream>>>,
    func_table: Arc<FuncTable>,
}

impl Context {
    pub fn new(
        name: impl Into<String>,
        hostname: Option<String>,
        username: Option<String>,
        key: Vec<u8>,
        parent_addr: Option<std::net::SocketAddr>,
    ) -> Self {
        Self {
            name: name.into(),
            hostname,
            username,
            key,
            parent_addr,
            stream: Mutex::new(None),
            func_table: Arc::new(FuncTable::new()),
        }
    }

    /// Bind this context to `stream` and install the persistent handler
    /// that answers [`CALL_FUNC_REF`] requests against this context's
    /// [`FuncTable`] (spec §4.2 "Callable marshalling").
    pub fn set_stream(&self, stream: Arc<Stream>) {
        let func_table = self.func_table.clone();
        let reply_stream = stream.clone();
        stream.add_handle_cb(
            CALL_FUNC_REF,
            true,
            Box::new(move |stream_lost, body| {
                if stream_lost {
                    return;
                }
                dispatch_func_ref(&reply_stream, &func_table, body);
            }),
        );
        *self.stream.lock() = Some(stream);
    }

    /// Register `f` as callable from the remote side and return the
    /// [`RemoteValue::FuncRef`] sentinel to embed in an outgoing value
    /// in its place (spec §4.2).
    pub fn publish_callable(&self, f: LocalCallable) -> RemoteValue {
        self.func_table.publish(self.stream().id(), f)
    }

    pub fn stream(&self) -> Arc<Stream> {
        self.stream
            .lock()
            .clone()
            .expect("Context used before its stream was set")
    }

    /// Enqueue `(reply_handle, module_name, func_name, args, kwargs)` on
    /// `CALL_FUNCTION` and block for a reply, up to `deadline`. Deadline
    /// expiry disconnects the stream and fails the call with
    /// [`TimeoutError`] — the in-flight reply can't be safely retracted,
    /// so the connection is sacrificed (spec §4.5 rationale).
    pub fn call_with_deadline(
        &self,
        fn_ref: &FnRef,
        deadline: Option<Duration>,
        args: Vec<RemoteValue>,
        kwargs: RemoteValue,
    ) -> Result<RemoteValue, ContextError> {
        let stream = self.stream();
        let call_body_for = |reply_handle: Handle| {
            RemoteValue::Seq(vec![
                RemoteValue::Int(reply_handle as i64),
                RemoteValue::Str(fn_ref.module_name.clone()),
                RemoteValue::Str(fn_ref.func_name.clone()),
                RemoteValue::Seq(args),
                kwargs,
            ])
        };
        blocking_request(&stream, CALL_FUNCTION, call_body_for, deadline)
    }

    /// `Call(fn, args…)` with no deadline (spec §4.5).
    pub fn call(&self, fn_ref: &FnRef, args: Vec<RemoteValue>) -> Result<RemoteValue, ContextError> {
        self.call_with_deadline(fn_ref, None, args, RemoteValue::Map(Vec::new()))
    }
}

/// Send a request on `out_handle` carrying the body `build_body` produces
/// once a reply handle has been allocated, then block for the matching
/// reply up to `deadline`. Shared by [`Context::call_with_deadline`] and
/// [`FuncProxy::call`] — both speak the same `(reply_handle, …)` request
/// shape and `(success, payload)` reply envelope (spec §4.5, §6).
fn blocking_request(
    stream: &Arc<Stream>,
    out_handle: Handle,
    build_body: impl FnOnce(Handle) -> RemoteValue,
    deadline: Option<Duration>,
) -> Result<RemoteValue, ContextError> {
    if stream.state() == crate::stream::StreamState::Disconnected {
        return Err(crate::error::StreamError::Disconnected.into());
    }
    let reply_handle = stream.alloc_handle();

    let pending = Arc::new((
        Mutex::new(PendingCall {
            done: false,
            lost: false,
            result: None,
        }),
        Condvar::new(),
    ));
    let pending_cb = pending.clone();

    stream.add_handle_cb(
        reply_handle,
        false,
        Box::new(move |stream_lost, body| {
            let (lock, cv) = &*pending_cb;
            let mut state = lock.lock();
            state.done = true;
            state.lost = stream_lost;
            state.result = Some(body);
            cv.notify_all();
        }),
    );

    stream
        .enqueue(out_handle, build_body(reply_handle))
        .map_err(crate::error::StreamError::from)?;

    let (lock, cv) = &*pending;
    let mut state = lock.lock();
    let timed_out = match deadline {
        None => {
            while !state.done {
                cv.wait(&mut state);
            }
            false
        }
        Some(deadline) => {
            let deadline_at = std::time::Instant::now() + deadline;
            let mut timed_out = false;
            while !state.done {
                let now = std::time::Instant::now();
                if now >= deadline_at {
                    timed_out = true;
                    break;
                }
                let result = cv.wait_for(&mut state, deadline_at - now);
                if result.timed_out() && !state.done {
                    timed_out = true;
                    break;
                }
            }
            timed_out
        }
    };

    if timed_out {
        drop(state);
        stream.disconnect();
        return Err(TimeoutError.into());
    }

    if state.lost {
        return Err(crate::error::StreamError::Disconnected.into());
    }

    match state.result.take().expect("done implies result is set") {
        RemoteValue::Seq(mut items) if items.len() == 2 => {
            let payload = items.pop().unwrap();
            let success = matches!(items.pop(), Some(RemoteValue::Bool(true)));
            if success {
                Ok(payload)
            } else {
                let (message, traceback) = unpack_exception(payload);
                Err(RemoteException { message, traceback }.into())
            }
        }
        other => Ok(other),
    }
}

/// A bound proxy for a remote [`RemoteValue::FuncRef`] sentinel: calling
/// it sends `(reply_handle, call_site_id, args, kwargs)` on
/// [`CALL_FUNC_REF`] back through the stream the sentinel arrived on and
/// blocks for the reply (spec §4.2 "Callable marshalling"). The original
/// source's `PartialFunction`/`_CallPersistentWhatsit` indirection has no
/// deadline, so neither does this.
pub struct FuncProxy {
    stream: Arc<Stream>,
    call_site_id: u64,
}

impl FuncProxy {
    pub fn call(&self, args: Vec<RemoteValue>, kwargs: RemoteValue) -> Result<RemoteValue, ContextError> {
        let call_site_id = self.call_site_id;
        let body_for = |reply_handle: Handle| {
            RemoteValue::Seq(vec![
                RemoteValue::Int(reply_handle as i64),
                RemoteValue::Int(call_site_id as i64),
                RemoteValue::Seq(args),
                kwargs,
            ])
        };
        blocking_request(&self.stream, CALL_FUNC_REF, body_for, None)
    }
}

/// Reconstitute a decoded [`RemoteValue::FuncRef`] into an invocable
/// [`FuncProxy`] bound to `stream` — the stream it arrived on, which is
/// also the stream `call_site_id` is scoped to. Returns `None` for any
/// other variant.
pub fn decode_func_ref(stream: &Arc<Stream>, value: &RemoteValue) -> Option<FuncProxy> {
    match value {
        RemoteValue::FuncRef { call_site_id, .. } => Some(FuncProxy {
            stream: stream.clone(),
            call_site_id: *call_site_id,
        }),
        _ => None,
    }
}

/// Decode one `(reply_handle, call_site_id, args, kwargs)` body off
/// [`CALL_FUNC_REF`], invoke it against `func_table`, and enqueue the
/// `(success, payload)` reply — the `FuncTable` counterpart of
/// `crate::remote_main::dispatch_call`.
fn dispatch_func_ref(stream: &Arc<Stream>, func_table: &FuncTable, body: RemoteValue) {
    let RemoteValue::Seq(mut items) = body else {
        return;
    };
    if items.len() != 4 {
        return;
    }
    let kwargs = items.pop().unwrap();
    let RemoteValue::Seq(args) = items.pop().unwrap() else {
        return;
    };
    let Some(call_site_id) = items.pop().and_then(|v| v.as_int()) else {
        return;
    };
    let Some(reply_handle) = items.pop().and_then(|v| v.as_int()) else {
        return;
    };
    let reply_handle = reply_handle as u64;

    let reply = match func_table.invoke(call_site_id as u64, args, kwargs) {
        Some(value) => RemoteValue::Seq(vec![RemoteValue::Bool(true), value]),
        None => RemoteValue::Seq(vec![
            RemoteValue::Bool(false),
            RemoteValue::Seq(vec![
                RemoteValue::Str(format!("unknown call_site_id {call_site_id}")),
                RemoteValue::Seq(Vec::new()),
            ]),
        ]),
    };
    let _ = stream.enqueue(reply_handle, reply);
}

fn unpack_exception(value: RemoteValue) -> (String, Vec<String>) {
    match value {
        RemoteValue::Seq(mut items) if items.len() == 2 => {
            let traceback = match items.pop() {
                Some(RemoteValue::Seq(frames)) => frames
                    .into_iter()
                    .filter_map(|f| f.as_str().map(str::to_owned))
                    .collect(),
                _ => Vec::new(),
            };
            let message = items
                .pop()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            (message, traceback)
        }
        other => (format!("{other:?}"), Vec::new()),
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
    fn call_with_deadline_times_out_and_disconnects_stream() {
        let (a, _b) = connected_pair();
        let stream = make_stream(a, b"key");
        let ctx = Context::new("peer", None, None, b"key".to_vec(), None);
        ctx.set_stream(stream.clone());

        let err = ctx
            .call_with_deadline(
                &FnRef::new("m", "f"),
                Some(Duration::from_millis(20)),
                vec![],
                RemoteValue::Map(Vec::new()),
            )
            .unwrap_err();
        assert!(matches!(err, ContextError::Timeout(_)));
        assert_eq!(stream.state(), crate::stream::StreamState::Disconnected);
    }

    #[test]
    fn call_succeeds_when_reply_arrives_before_deadline() {
        let (a, b) = connected_pair();
        let key = b"sharedkey";
        let caller_stream = make_stream(a, key);
        let callee_stream = make_stream(b, key);

        let ctx = Context::new("peer", None, None, key.to_vec(), None);
        ctx.set_stream(caller_stream.clone());

        // Simulate the remote side: read the call, reply with (true, 99).
        let callee = callee_stream.clone();
        let responder = std::thread::spawn(move || {
            for _ in 0..50 {
                callee.receive_once().ok();
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        callee_stream.add_handle_cb(
            CALL_FUNCTION,
            true,
            Box::new({
                let callee = callee_stream.clone();
                move |_closed, body| {
                    if let RemoteValue::Seq(items) = body {
                        if let Some(RemoteValue::Int(reply_handle)) = items.first() {
                            callee
                                .enqueue(
                                    *reply_handle as u64,
                                    RemoteValue::Seq(vec![
                                        RemoteValue::Bool(true),
                                        RemoteValue::Int(99),
                                    ]),
                                )
                                .unwrap();
                            while callee.transmit_once().unwrap() {}
                        }
                    }
                }
            }),
        );

        let call_thread = std::thread::spawn(move || {
            ctx.call(&FnRef::new("m", "f"), vec![RemoteValue::Int(1)])
        });

        // Drive the caller side's own receive loop concurrently.
        for _ in 0..50 {
            caller_stream.transmit_once().ok();
            caller_stream.receive_once().ok();
            std::thread::sleep(Duration::from_millis(5));
        }

        let result = call_thread.join().unwrap().unwrap();
        assert_eq!(result, RemoteValue::Int(99));
        responder.join().unwrap();
    }

    #[test]
    fn func_proxy_calls_back_through_the_origin_stream() {
        let (a, b) = connected_pair();
        let key = b"sharedkey";
        let owner_stream = make_stream(a, key);
        let caller_stream = make_stream(b, key);

        let owner_ctx = Context::new("owner", None, None, key.to_vec(), None);
        owner_ctx.set_stream(owner_stream.clone());

        let sentinel = owner_ctx.publish_callable(Box::new(|args, _kwargs| {
            RemoteValue::Int(args.iter().filter_map(RemoteValue::as_int).sum())
        }));

        let owner = owner_stream.clone();
        let responder = std::thread::spawn(move || {
            for _ in 0..50 {
                owner.receive_once().ok();
                owner.transmit_once().ok();
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let proxy = decode_func_ref(&caller_stream, &sentinel).expect("FuncRef decodes to a proxy");
        let call_thread = std::thread::spawn(move || {
            proxy.call(
                vec![RemoteValue::Int(2), RemoteValue::Int(3)],
                RemoteValue::Map(Vec::new()),
            )
        });

        for _ in 0..50 {
            caller_stream.transmit_once().ok();
            caller_stream.receive_once().ok();
            std::thread::sleep(Duration::from_millis(5));
        }

        let result = call_thread.join().unwrap().unwrap();
        assert_eq!(result, RemoteValue::Int(5));
        responder.join().unwrap();
    }
}
