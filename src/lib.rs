pub mod api;
pub mod assets;
pub mod config;
pub mod controller;
pub mod error;
pub mod persistence;
pub mod security;
pub mod tasks;
pub mod uploads;
pub mod worker;
pub mod zipstream;
