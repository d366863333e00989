pub mod admin;
pub mod config;
pub mod humanize;
pub mod ledger;
pub mod maintenance;
pub mod observability;
pub mod proto;
