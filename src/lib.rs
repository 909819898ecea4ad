pub mod alarm;
pub mod alert;
pub mod config;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod probe;
pub mod state;
pub mod store;
