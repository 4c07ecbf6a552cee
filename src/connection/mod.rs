//! Connection management: one leased, self-healing session per server

pub(crate) mod dispatcher;
pub mod lease;
mod manager;

pub use lease::LeaseManager;
pub use manager::{ConnectionManager, InvalidationListener};
