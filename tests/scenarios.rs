//! Whole-crate scenarios mirroring the concrete test cases and universal
//! invariants this runtime is built against: a caller-side `Context`
//! talking to a callee-side `FunctionRegistry` dispatch loop over a real
//! TCP pair, with a `Broker` actually driving the I/O in the concurrency
//! and resilience cases rather than a hand-pumped `receive_once`/
//! `transmit_once` loop.

use std::net::{SocketAddr, TcpListener as StdListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;

use remctx::broker::{Broker, StreamToken};
use remctx::channel::Channel;
use remctx::context::{Context, FnRef};
use remctx::error::ContextError;
use remctx::marshal::RemoteValue;
use remctx::registry::FunctionRegistry;
use remctx::stream::Stream;
use remctx::wire::CALL_FUNCTION;

fn connected_pair() -> (MioTcpStream, MioTcpStream) {
    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    server.set_nonblocking(true).unwrap();
    (MioTcpStream::from_std(server), MioTcpStream::from_std(client))
}

fn make_stream(io: MioTcpStream, key: &[u8], broker: Weak<Broker>) -> Arc<Stream> {
    Arc::new(Stream::new(1, io, StreamToken(99), key, broker))
}

fn make_stream_with_token(
    io: MioTcpStream,
    key: &[u8],
    token: StreamToken,
    broker: Weak<Broker>,
) -> Arc<Stream> {
    Arc::new(Stream::new(1, io, token, key, broker))
}

/// A minimal callee-side dispatch loop, grounded the same way
/// `remote_main::dispatch_call` is: decode `(reply_handle, module, func,
/// args, kwargs)`, run it through a registry, enqueue `(success, payload)`.
fn install_call_dispatch(stream: Arc<Stream>, registry: Arc<FunctionRegistry>) {
    stream.add_handle_cb(
        CALL_FUNCTION,
        true,
        Box::new(move |_stream_lost, body| {
            let RemoteValue::Seq(mut items) = body else {
                return;
            };
            if items.len() != 5 {
                return;
            }
            let kwargs = items.pop().unwrap();
            let RemoteValue::Seq(args) = items.pop().unwrap() else {
                return;
            };
            let Some(func_name) = items.pop().and_then(|v| v.as_str().map(str::to_owned)) else {
                return;
            };
            let Some(module_name) = items.pop().and_then(|v| v.as_str().map(str::to_owned)) else {
                return;
            };
            let Some(reply_handle) = items.pop().and_then(|v| v.as_int()) else {
                return;
            };
            let fn_ref = FnRef::new(module_name, func_name);
            let reply = match registry.dispatch(&fn_ref, args, kwargs) {
                Ok(value) => RemoteValue::Seq(vec![RemoteValue::Bool(true), value]),
                Err(e) => RemoteValue::Seq(vec![
                    RemoteValue::Bool(false),
                    RemoteValue::Seq(vec![
                        RemoteValue::Str(e.to_string()),
                        RemoteValue::Seq(Vec::new()),
                    ]),
                ]),
            };
            let _ = stream.enqueue(reply_handle as u64, reply);
        }),
    );
}

/// S1: a call against a registered function returns a value distinct
/// from the caller's own process id — standing in for the source
/// material's `os.getpid` scenario, since this runtime has no concept of
/// "the remote process's pid" beyond whatever the registry reports.
#[test]
fn s1_call_returns_value_distinct_from_caller_pid() {
    let (a, b) = connected_pair();
    let key = b"sharedkey";
    let caller_stream = make_stream(a, key, Weak::new());
    let callee_stream = make_stream(b, key, Weak::new());

    let mut registry = FunctionRegistry::new();
    let remote_pid: i64 = std::process::id() as i64 + 1;
    registry.register("os", "getpid", move |_args, _kwargs| {
        Ok(RemoteValue::Int(remote_pid))
    });
    install_call_dispatch(callee_stream.clone(), Arc::new(registry));

    let ctx = Context::new("L", None, None, key.to_vec(), None);
    ctx.set_stream(caller_stream.clone());

    let driver_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop2 = driver_stop.clone();
    let caller2 = caller_stream.clone();
    let callee2 = callee_stream.clone();
    let driver = std::thread::spawn(move || {
        while !stop2.load(Ordering::Relaxed) {
            caller2.transmit_once().ok();
            callee2.receive_once().ok();
            callee2.transmit_once().ok();
            caller2.receive_once().ok();
            std::thread::sleep(Duration::from_millis(2));
        }
    });

    let result = ctx
        .call(&FnRef::new("os", "getpid"), vec![])
        .expect("call should succeed");

    driver_stop.store(true, Ordering::Relaxed);
    driver.join().unwrap();

    assert_eq!(result, RemoteValue::Int(remote_pid));
    assert_ne!(result, RemoteValue::Int(std::process::id() as i64));
}

/// S2 / invariant #6: a deadline shorter than the remote's service time
/// disconnects the stream and raises timeout; a second call on the same
/// context then fails with a stream error rather than hanging again.
#[test]
fn s2_short_deadline_times_out_then_stream_is_dead() {
    let (a, _b) = connected_pair();
    let key = b"sharedkey";
    // Nothing ever answers — `_b` is held but never driven.
    let caller_stream = make_stream(a, key, Weak::new());
    let ctx = Context::new("L", None, None, key.to_vec(), None);
    ctx.set_stream(caller_stream.clone());

    let err = ctx
        .call_with_deadline(
            &FnRef::new("slow", "work"),
            Some(Duration::from_millis(30)),
            vec![],
            RemoteValue::Map(Vec::new()),
        )
        .unwrap_err();
    assert!(matches!(err, ContextError::Timeout(_)));

    let err2 = ctx
        .call(&FnRef::new("slow", "work"), vec![])
        .unwrap_err();
    assert!(matches!(err2, ContextError::Stream(_)));
}

/// S3 / invariant #1 & #3: many threads calling concurrently on one
/// context each get back their own argument, driven by a real `Broker`
/// thread rather than a hand-pumped loop.
#[test]
fn s3_concurrent_calls_do_not_cross_wires() {
    let handle = Broker::spawn(None, None).unwrap();
    let broker = handle.broker.clone();

    let (a, b) = connected_pair();
    let key = b"sharedkey";
    let caller_stream = make_stream_with_token(a, key, broker.next_token(), Arc::downgrade(&broker));
    let callee_stream = make_stream_with_token(b, key, broker.next_token(), Arc::downgrade(&broker));

    let mut registry = FunctionRegistry::new();
    registry.register("demo", "echo", |args, _kwargs| {
        Ok(args.into_iter().next().unwrap_or(RemoteValue::Unit))
    });
    install_call_dispatch(callee_stream.clone(), Arc::new(registry));

    for stream in [caller_stream.clone(), callee_stream.clone()] {
        let (tx, rx) = std::sync::mpsc::channel();
        broker.register_stream(stream.clone(), move |result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap().unwrap();
        stream.mark_connected();
    }

    let ctx = Arc::new(Context::new("L", None, None, key.to_vec(), None));
    ctx.set_stream(caller_stream.clone());

    const THREADS: i64 = 4;
    const CALLS_PER_THREAD: i64 = 25;
    let mut handles = Vec::new();
    for t in 0..THREADS {
        let ctx = ctx.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..CALLS_PER_THREAD {
                let x = t * CALLS_PER_THREAD + i;
                let result = ctx
                    .call(&FnRef::new("demo", "echo"), vec![RemoteValue::Int(x)])
                    .unwrap();
                assert_eq!(result, RemoteValue::Int(x));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    handle.shutdown().unwrap();
}

/// S4: a fresh `Channel` handle carries `send(1)`, `send(2)`, `send(3)`,
/// `close`, and the receiving iterator yields exactly those three values
/// then stops.
#[test]
fn s4_channel_send_then_close_drains_and_stops() {
    let (a, b) = connected_pair();
    let key = b"sharedkey";
    let sa = make_stream(a, key, Weak::new());
    let sb = make_stream(b, key, Weak::new());

    let handle = 42;
    let chan_a = Channel::new(sa.clone(), handle);
    let chan_b = Channel::new(sb.clone(), handle);

    for v in [1, 2, 3] {
        chan_a.send(RemoteValue::Int(v)).unwrap();
    }
    chan_a.close().unwrap();

    while sa.transmit_once().unwrap() {}
    for _ in 0..10 {
        sb.receive_once().ok();
        std::thread::sleep(Duration::from_millis(5));
    }

    let values: Vec<RemoteValue> = chan_b.iter().collect();
    assert_eq!(
        values,
        vec![RemoteValue::Int(1), RemoteValue::Int(2), RemoteValue::Int(3)]
    );
}

/// S5 / invariant #2: a single bit flip inside a frame's payload is
/// reported as a corrupt frame; the handle's callback never fires for
/// that frame, and a subsequent disconnect (as the broker would perform)
/// invokes every installed callback exactly once with the closed flag.
#[test]
fn s5_bit_flip_is_corrupt_and_callback_never_fires_for_it() {
    use std::io::Write;

    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut attacker = std::net::TcpStream::connect(addr).unwrap();
    let (victim_raw, _) = listener.accept().unwrap();
    victim_raw.set_nonblocking(true).unwrap();

    let key = b"sharedkey";
    let victim_stream = make_stream(MioTcpStream::from_std(victim_raw), key, Weak::new());

    let fired = Arc::new(AtomicU64::new(0));
    let fired2 = fired.clone();
    victim_stream.add_handle_cb(
        CALL_FUNCTION,
        true,
        Box::new(move |_closed, _body| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let mut mac = remctx::wire::new_mac_state(key);
    let mut frame = remctx::wire::encode_frame(&mut mac, CALL_FUNCTION, RemoteValue::Str("hello".into())).unwrap();
    let flip_at = frame.len() - 1;
    frame[flip_at] ^= 0x01;
    attacker.write_all(&frame).unwrap();

    std::thread::sleep(Duration::from_millis(20));
    let err = victim_stream.receive_once().unwrap_err();
    assert!(matches!(
        err,
        remctx::stream::StreamIoError::Corrupt(remctx::error::CorruptFrameError::MacMismatch)
    ));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    victim_stream.disconnect();
    assert_eq!(
        victim_stream.state(),
        remctx::stream::StreamState::Disconnected
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// S6: the broker survives an accepted connection that immediately
/// drops (standing in for an SSH attempt against a nonexistent host
/// failing fast) and can still service a legitimate connection
/// afterward.
#[test]
fn s6_broker_survives_a_failed_connection_and_keeps_accepting() {
    let handle = Broker::spawn(Some("127.0.0.1:0".parse().unwrap()), {
        let accepted: Arc<std::sync::Mutex<Vec<Arc<Stream>>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        Some(Arc::new(move |io: MioTcpStream, _peer: SocketAddr, broker: Weak<Broker>| {
            let Some(broker) = broker.upgrade() else {
                return;
            };
            let token = broker.next_token();
            let stream = Arc::new(Stream::new(1, io, token, b"sharedkey", Arc::downgrade(&broker)));
            let stream_cb = stream.clone();
            broker.register_stream(stream.clone(), move |result| {
                if result.is_ok() {
                    stream_cb.mark_connected();
                }
            });
            accepted.lock().unwrap().push(stream);
        }))
    })
    .unwrap();

    let addr = handle.listen_addr().unwrap();

    // A connection that immediately closes without sending anything.
    {
        let bad = std::net::TcpStream::connect(addr).unwrap();
        drop(bad);
    }
    std::thread::sleep(Duration::from_millis(50));
    assert!(handle.broker.is_running());

    // A legitimate connection still works afterward.
    let good = std::net::TcpStream::connect(addr).unwrap();
    good.set_nonblocking(true).unwrap();
    let good_mio = MioTcpStream::from_std(good);
    let good_stream = make_stream(good_mio, b"sharedkey", Arc::downgrade(&handle.broker));
    good_stream
        .enqueue(CALL_FUNCTION, RemoteValue::Str("ping".into()))
        .unwrap();
    while good_stream.transmit_once().unwrap() {}

    std::thread::sleep(Duration::from_millis(50));
    assert!(handle.broker.is_running());

    handle.shutdown().unwrap();
}
