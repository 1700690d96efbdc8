pub mod cache;
pub mod config;
pub mod db;
pub mod forecast;
pub mod ingest;
pub mod monitoring;
pub mod risk;
pub mod weather;
