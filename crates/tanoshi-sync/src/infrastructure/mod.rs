pub mod config;
pub mod database;
pub mod registry;
pub mod repositories;
