pub mod config;
pub mod envsubst;
pub mod observability;
