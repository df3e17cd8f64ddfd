pub mod agent;
pub mod api;
pub mod client;
pub mod config;
pub mod decoder;
pub mod health;
pub mod logging;
pub mod model;
pub mod proposal;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod timeline;
pub mod types;

pub use types::*;

pub use api::AppState;
