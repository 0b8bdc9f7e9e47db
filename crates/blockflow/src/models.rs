//! These models represent the objects the engine reads from and writes to the graph store
//!
//! There are a few related formats in play:
//! - boards, blocks and connections, owned by the canvas and only read here
//! - the append-only message log of each block, including injected `context` messages
//! - references that quote a character range of an earlier message
//! - encrypted provider credentials
//!
//! Messages sent to a provider are converted into the normalized `ChatMessage` first and
//! only the provider adapters know about the individual wire formats.
pub mod board;
pub mod credential;
pub mod message;
pub mod reference;
pub mod role;
