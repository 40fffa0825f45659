pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod models;
pub mod ports;
pub mod remote;
pub mod sim;
