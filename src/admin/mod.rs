//! Administrative HTTP surface of the bookie.
//!
//! - `GET /health`: lifecycle state, read-only flag and counters
//! - `GET /ledgers/{id}`: fence state, LAC and last stored entry
//! - `POST /admin/checkpoint`: checkpoint at the current journal position
//! - `POST /admin/gc`: one garbage collection cycle
//! - `POST /admin/ledgers/{id}/deleted`: record a ledger deletion

mod error;
pub mod models;
mod server;
pub mod services;
pub mod state;

pub use error::AdminError;
pub use server::{router, serve};
pub use state::AdminState;
