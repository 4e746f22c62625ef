//! Sync Engine wire types and shared presence state
//!
//! Messages exchanged with viewers and the state the server keeps for them.

mod protocol;
mod state;

pub use protocol::*;
pub use state::*;
