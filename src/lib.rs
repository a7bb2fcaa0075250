pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod evidence;
pub mod extract;
pub mod logging;
pub mod payload;
pub mod pipeline;
pub mod processor;
pub mod report;
pub mod session;
pub mod strings;
