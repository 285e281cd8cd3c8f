// Library exports for eventdesk
// This allows integration tests and external code to use eventdesk modules

pub mod auth;
pub mod capacity;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod extractors;
pub mod routes;
pub mod state;
pub mod storage;
pub mod tree;
