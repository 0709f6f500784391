pub mod config;
pub mod errors;
pub mod execution;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod publish;
pub mod runner;
pub mod server;
pub mod signals;
pub mod tracker;
pub mod util;

#[cfg(test)]
pub mod test_support;
