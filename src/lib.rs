pub mod agent;
pub mod config;
pub mod device;
pub mod estimator;
pub mod ingest;
pub mod render;
pub mod state;
pub mod tracer;
