pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod generator;
pub mod instance;
pub mod lock;
pub mod logging;
pub mod output;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod workflow;

#[cfg(test)]
mod testing;
