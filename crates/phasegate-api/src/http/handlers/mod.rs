//! HTTP request handlers for the REST API.

pub mod config;
pub mod instance;
