pub mod bus;
pub mod cancel;
pub mod engine;
pub mod events;
pub mod judge;
pub mod model;
pub mod providers;
pub mod retry;
pub mod storage;

pub use engine::{Engine, EngineError};
pub use storage::Store;
