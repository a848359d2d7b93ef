pub mod app;
pub mod cache;
pub mod config;
pub mod environment;
pub mod gateway_metrics;
pub mod http;
pub mod jobs;
pub mod read_through;
pub mod ui;
pub mod upstream;
