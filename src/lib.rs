pub mod account;
pub mod catalog;
pub mod cleanup;
pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod instance;
pub mod launch;
pub mod log;
pub mod manager;
pub mod notify;
pub mod options;
pub mod paths;
pub mod pid;
pub mod ports;
pub mod protocol;
pub mod query;
pub mod recognizer;
pub mod registry;
pub mod reputation;
pub mod store;
pub mod supervisor;
