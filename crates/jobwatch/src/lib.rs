pub mod context;
pub mod detector;
pub mod fetcher;
pub mod formatter;
pub mod notifier;
pub mod parser;
pub mod pipeline;
pub mod posting;
pub mod store;

pub const PROJECT_NAME: &str = "jobwatch";
pub const LOG_TARGET: &str = "jobwatch::run";
