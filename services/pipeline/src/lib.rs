pub mod config;
pub mod hub;
pub mod serve;
pub mod stages;
pub mod tracking;

pub use config::AppConfig;
