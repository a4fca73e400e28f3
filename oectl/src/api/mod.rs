//! API-facing types consumed by the routing layer.

pub mod models;
