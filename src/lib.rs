pub mod agent;
pub mod cache;
pub mod capture;
pub mod config;
pub mod correlator;
pub mod error;
pub mod event;
pub mod frame;
pub mod log;
pub mod rate_limit;
pub mod session;
pub mod stack_parser;
pub mod transport;
pub mod watchdog;

pub use agent::{Agent, AgentBuilder};
pub use error::Error;
