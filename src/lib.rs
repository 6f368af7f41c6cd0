//! Company-analysis reports generated from retrieved sources and verified
//! against them before they are stored.

pub mod anthropic;
pub mod company;
pub mod config;
pub mod error;
pub mod gate;
pub mod micro_agents;
pub mod orchestrator;
pub mod parser;
pub mod progress;
pub mod report;
pub mod retrieval;
pub mod schema;
pub mod state_machine;
pub mod store;
pub mod verify;

#[cfg(test)]
mod testing;
