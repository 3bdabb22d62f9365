pub mod api;
pub mod config;
pub mod data_models;
pub mod error;
pub mod media;
pub mod prober;
pub mod query;
pub mod session;
pub mod tags;
pub mod upstream;
