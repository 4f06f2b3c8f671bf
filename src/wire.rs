//! Frame & MAC codec.
//!
//! See spec §4.1 and §6 "Wire format". A frame is
//! `MAC(20 bytes) ‖ length(4 bytes, big-endian) ‖ payload(length bytes)`.
//! The payload deserialises to `(handle, body)`.
//!
//! The MAC is a *rolling* HMAC-SHA1: the sender and receiver each keep a
//! single `Hmac<Sha1>` instance fed continuously by every frame's
//! `length ‖ payload` bytes for the life of the stream, never reset. A
//! digest is read off by cloning the running state and finalising the
//! clone (mirroring the source material's `hmac.copy()` trick), so the
//! original keeps accumulating. A skipped or reordered frame permanently
//! desynchronises the two sides' chains; any subsequent frame then fails
//! MAC verification, which is the point (spec §4.1 rationale).

use bytes::{Buf, BytesMut};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::error::CorruptFrameError;
use crate::marshal::RemoteValue;

/// Handle reserved for the module-import fallback request (spec §4.9, §6).
pub const GET_MODULE: u64 = 0;
/// Handle reserved for outbound/inbound function calls (spec §4.5, §6).
pub const CALL_FUNCTION: u64 = 1;
/// Handle reserved for calling back through a [`crate::context::FuncProxy`]
/// (spec §4.2 "Callable marshalling").
pub const CALL_FUNC_REF: u64 = 2;

/// Per-stream handle: a monotonically increasing 64-bit tag that
/// demultiplexes frames to callbacks on the receiving side.
pub type Handle = u64;

const MAC_LEN: usize = 20;
const LEN_PREFIX: usize = 4;
const HEADER_LEN: usize = MAC_LEN + LEN_PREFIX;

/// The `(handle, body)` pair every frame's payload deserialises to.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    handle: Handle,
    body: RemoteValue,
}

/// Rolling MAC state, one per direction per stream.
pub fn new_mac_state(key: &[u8]) -> Hmac<Sha1> {
    Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts keys of any length")
}

/// Serialise `(handle, body)`, update `mac_state` with `length ‖ payload`,
/// and return the complete framed bytes ready to append to a stream's
/// output buffer.
pub fn encode_frame(
    mac_state: &mut Hmac<Sha1>,
    handle: Handle,
    body: RemoteValue,
) -> Result<Vec<u8>, CorruptFrameError> {
    let envelope = Envelope { handle, body };
    let payload =
        rmp_serde::to_vec_named(&envelope).map_err(|e| crate::marshal::MarshalError::Encode(e.to_string()))?;
    let len_bytes = (payload.len() as u32).to_be_bytes();

    mac_state.update(&len_bytes);
    mac_state.update(&payload);
    let digest = mac_state.clone().finalize().into_bytes();

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&digest);
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Attempt to pull one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` if the buffer doesn't yet hold a complete frame.
/// On success, advances `buf` past the consumed frame (MAC-inclusive —
/// see spec §9 Open Questions on the source's off-by-one) and updates
/// `mac_state`. A MAC mismatch or malformed payload is `Err` and is
/// always fatal for the owning stream (spec §4.1, §7).
pub fn try_decode_frame(
    buf: &mut BytesMut,
    mac_state: &mut Hmac<Sha1>,
    max_len: usize,
) -> Result<Option<(Handle, RemoteValue)>, CorruptFrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes(buf[MAC_LEN..HEADER_LEN].try_into().unwrap()) as usize;
    if len > max_len {
        return Err(CorruptFrameError::TooLarge(len));
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    mac_state.update(&buf[MAC_LEN..HEADER_LEN]);
    mac_state.update(&buf[HEADER_LEN..HEADER_LEN + len]);
    let expected = mac_state.clone().finalize().into_bytes();

    if expected.as_slice() != &buf[0..MAC_LEN] {
        return Err(CorruptFrameError::MacMismatch);
    }

    let envelope: Envelope = rmp_serde::from_slice(&buf[HEADER_LEN..HEADER_LEN + len])
        .map_err(|e| crate::marshal::MarshalError::Decode(e.to_string()))?;
    buf.advance(HEADER_LEN + len);

    Ok(Some((envelope.handle, envelope.body)))
}
