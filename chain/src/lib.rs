//! A deterministic single-node chain.
//!
//! Transactions enter through the [`txpool::TxPool`], are assembled into
//! blocks by the [`miner::Miner`] on top of the live
//! [`simchain_state::state_db::StateDb`], and are persisted by the
//! [`writer::BlockWriter`]. [`blockchain::Blockchain`] ties these together
//! and answers queries, reading through to a forked remote chain when one is
//! configured.

pub mod blockchain;
pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod estimator;
pub mod events;
pub mod executor;
pub mod heap;
pub mod miner;
pub mod time;
pub mod tracing;
pub mod txpool;
pub mod wallet;
pub mod writer;

pub use error::{AdmissionError, ChainError};
