//! Core protocol types.
//!
//! This module contains the types shared across the stack: JIDs, the wire
//! message union, tag generation, and lifecycle events.

mod events;
mod jid;
mod message;

pub use events::*;
pub use jid::*;
pub use message::*;
