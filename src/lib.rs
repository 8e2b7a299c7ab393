//! Debug-session bridge for RIDE-protocol APL interpreters.
//!
//! The bridge spawns an interpreter process, speaks the length-prefixed RIDE
//! wire protocol to it, and exposes a debugger-session object on top:
//! breakpoints, stepping (forward and backward), expression evaluation,
//! value tips, variable-tree expansion and call-stack retrieval. An editor-
//! facing protocol layer (DAP or otherwise) sits on [`runtime::client::Bridge`]
//! and receives session events through [`runtime::SessionHook`].

pub mod fs;
pub mod runtime;
