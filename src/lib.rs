pub mod actuate;
pub mod config;
pub mod cycle;
pub mod history;
pub mod llm;
pub mod prompt;
pub mod sanity;
pub mod sensors;
pub mod server;
pub mod site;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod weather;
