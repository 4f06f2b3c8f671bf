//! A remote execution runtime: a controller launches secondary
//! interpreter-equivalent processes — locally or over SSH — and talks to
//! them over an authenticated, framed, MAC-protected channel, invoking
//! registered functions and exchanging marshalled values.
//!
//! See `SPEC_FULL.md` for the full module-by-module design and
//! `DESIGN.md` for how each part is grounded.

pub mod bootstrap;
pub mod broker;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod import_fallback;
pub mod marshal;
pub mod registry;
pub mod remote_main;
pub mod stream;
pub mod wire;
