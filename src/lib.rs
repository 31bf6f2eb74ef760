pub mod compiler;
pub mod config;
pub mod executions;
pub mod flows;
pub mod server;
