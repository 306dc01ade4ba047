pub mod admission;
pub mod audit;
pub mod capability;
pub mod config;
pub mod error;
pub mod metrics;
pub mod render;
pub mod selector;
pub mod server;
pub mod servers;
pub mod store;
pub mod subscription;
pub mod types;
pub mod users;
pub mod utils;
