// Library exports for Glare
// This allows integration tests and external code to use Glare modules

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod ledger;
pub mod routes;
pub mod state;
pub mod trending;
