// memlink-common - Shared wire vocabulary for the memlink client
//
// This crate defines the command/response model, key rules, and the binary
// protocol header layout shared by the codec and the client.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
