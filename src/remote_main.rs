//! Remote main — the entry point inside a bootstrapped child context.
//!
//! See spec §4.8 (source material's `ExternalContextMain`). Once
//! [`crate::bootstrap::run_stage2`] hands back a `BootstrapConfig`, this
//! module starts a [`Broker`], opens a fresh TCP connection back to the
//! controller's listen address, registers itself as the `parent`
//! [`Context`], and services `CALL_FUNCTION` requests against a
//! [`FunctionRegistry`] supplied by the embedder until the stream dies.

use std::net::TcpStream as StdTcpStream;
use std::sync::Arc;

use mio::net::TcpStream;

use crate::bootstrap::BootstrapConfig;
use crate::broker::Broker;
use crate::channel::Channel;
use crate::context::{Context, FnRef};
use crate::marshal::RemoteValue;
use crate::registry::FunctionRegistry;
use crate::stream::Stream;
use crate::wire::CALL_FUNCTION;

/// Failures starting or running the remote side of a context.
#[derive(Debug, thiserror::Error)]
pub enum RemoteMainError {
    #[error("I/O error connecting to parent: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),
}

/// Run the remote side of a context until its stream to the parent
/// disconnects. Blocks the calling thread (spec §4.8: this *is* the
/// remote process's main loop).
pub fn run(config: BootstrapConfig, registry: FunctionRegistry) -> Result<(), RemoteMainError> {
    let handle = Broker::spawn(None, None)?;
    let broker = handle.broker.clone();

    let std_stream = StdTcpStream::connect(config.parent_addr)?;
    std_stream.set_nonblocking(true)?;
    let mio_stream = TcpStream::from_std(std_stream);

    let token = broker.next_token();
    let stream = Arc::new(Stream::new(
        0,
        mio_stream,
        token,
        &config.key,
        Arc::downgrade(&broker),
    ));

    let (tx, rx) = std::sync::mpsc::channel();
    broker.register_stream(stream.clone(), move |result| {
        let _ = tx.send(result);
    });
    rx.recv()
        .expect("broker dropped the registration callback")?;
    stream.mark_connected();

    let parent = Context::new("parent", None, None, config.key.clone(), Some(config.parent_addr));
    parent.set_stream(stream.clone());

    // Identify ourselves to the parent's accept loop (spec §4.7
    // `Stream.Connect`: "Enqueue(0, context.name)").
    stream
        .enqueue(0, RemoteValue::Str(config.context_name.clone()))
        .ok();

    let channel = Channel::new(stream.clone(), CALL_FUNCTION);
    for call in channel.iter() {
        dispatch_call(&stream, &registry, call);
    }

    handle.shutdown().ok();
    Ok(())
}

/// Decode one `(reply_handle, module_name, func_name, args, kwargs)`
/// body, dispatch it through `registry`, and enqueue the reply (spec
/// §4.8).
fn dispatch_call(stream: &Arc<Stream>, registry: &FunctionRegistry, call: RemoteValue) {
    let RemoteValue::Seq(mut items) = call else {
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
    let reply_handle = reply_handle as u64;

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
    let _ = stream.enqueue(reply_handle, reply);
}
