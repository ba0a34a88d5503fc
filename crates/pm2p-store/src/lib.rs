pub mod backend;
pub mod log;
pub mod sqlite;
pub mod store;

pub use backend::{BackendKind, StoreBackend};
pub use store::MessageStore;
