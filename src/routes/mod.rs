//! HTTP route modules

pub mod health;
pub mod sync;
