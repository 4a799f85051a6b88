//! services/api/src/lib.rs
//!
//! The HTTP service around `coupon_book_core`: Postgres and Redis adapters,
//! the REST layer and the code generation workers.

pub mod adapters;
pub mod config;
pub mod error;
pub mod web;
pub mod worker;
