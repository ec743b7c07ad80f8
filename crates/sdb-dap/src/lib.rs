pub mod adapter;
pub mod engine;
pub mod error;
pub mod log;
pub mod protocol;
pub mod server;

pub use server::start;
