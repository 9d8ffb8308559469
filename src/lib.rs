// Library entrypoint for the server binary and integration tests.
pub mod api;
pub mod assistant;
pub mod channels;
pub mod config;
pub mod queue;
pub mod relay;
pub mod shutdown;
pub mod state;
pub mod storage;

pub use api::build_router;
