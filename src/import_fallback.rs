//! Module-import fallback — wire contract only.
//!
//! See spec §4.9. The source material's `SlaveModuleImporter` hooks
//! Python's import machinery so that when a module can't be found
//! locally, the remote side asks its parent for the module's source and
//! loads it dynamically. Rust has no equivalent runtime load step, so
//! this module implements only the reserved handle and the
//! request/response shapes — a [`ModuleProvider`] is the hook an
//! embedder fills in if it wants to serve precompiled plugin bytes (or
//! simply to report that a module is unavailable). No dynamic code
//! loading happens here, which spec §4.9 explicitly allows.

use crate::marshal::RemoteValue;
use crate::wire::GET_MODULE;

/// A request for a module's bytes by fully-qualified name, sent on the
/// reserved [`GET_MODULE`] handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRequest {
    pub fullname: String,
}

/// The parent's answer: `None` if it has nothing for that name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleResponse {
    pub fullname: String,
    pub bytes: Option<Vec<u8>>,
}

/// Implemented by an embedder that wants to serve module bytes to child
/// contexts over [`GET_MODULE`]. The default behaviour (no provider
/// installed) is to answer every request with `bytes: None`.
pub trait ModuleProvider: Send + Sync {
    fn provide(&self, fullname: &str) -> Option<Vec<u8>>;
}

pub fn encode_request(req: &ModuleRequest) -> RemoteValue {
    RemoteValue::Str(req.fullname.clone())
}

pub fn decode_request(body: RemoteValue) -> Option<ModuleRequest> {
    body.as_str().map(|s| ModuleRequest {
        fullname: s.to_string(),
    })
}

pub fn encode_response(resp: &ModuleResponse) -> RemoteValue {
    RemoteValue::Seq(vec![
        RemoteValue::Str(resp.fullname.clone()),
        match &resp.bytes {
            Some(b) => RemoteValue::Bytes(b.clone()),
            None => RemoteValue::Unit,
        },
    ])
}

pub fn decode_response(body: RemoteValue) -> Option<ModuleResponse> {
    match body {
        RemoteValue::Seq(mut items) if items.len() == 2 => {
            let bytes = match items.pop() {
                Some(RemoteValue::Bytes(b)) => Some(b),
                _ => None,
            };
            let fullname = items.pop()?.as_str()?.to_string();
            Some(ModuleResponse { fullname, bytes })
        }
        _ => None,
    }
}

/// Confirms the reserved handle constant lines up with [`GET_MODULE`]
/// used elsewhere in the wire layer (spec §3, §6).
pub const HANDLE: u64 = GET_MODULE;
