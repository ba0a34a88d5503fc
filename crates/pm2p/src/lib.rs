pub mod client;
pub mod error;
pub mod message;
pub mod protocol;
pub mod time;

/// Port a node listens on when none is configured.
pub const DEFAULT_PORT: u16 = 1123;
