pub mod acquire;
pub mod adb;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod gate;
pub mod logging;
pub mod models;
pub mod output;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;
