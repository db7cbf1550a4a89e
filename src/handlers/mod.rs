//! HTTP handlers. Thin adapters from requests to the service layer.

pub mod bucket_handlers;
pub mod guest_handlers;
pub mod health_handlers;
pub mod owner;
