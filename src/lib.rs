pub mod acquire;
pub mod climate;
pub mod config;
pub mod domain;
pub mod earthengine;
pub mod error;
pub mod inat;
pub mod input;
pub mod ledger;
pub mod location;
pub mod orchestrator;
pub mod output;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod vegetation;
pub mod watchdog;
