pub mod agents;
pub mod artifact;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod doctor;
pub mod error;
pub mod gaps;
pub mod manager;
pub mod pipeline;
pub mod plugins;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;

#[cfg(test)]
mod tests;
