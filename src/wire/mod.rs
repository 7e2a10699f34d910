//! Wire codecs.
//!
//! Two encodings exist on the wire: the versioned binary envelope used by
//! framed mode ([`envelope`]) and the legacy `"<tag>,<json>"` text mode
//! ([`legacy`]).

mod envelope;
pub mod legacy;

pub use envelope::*;
