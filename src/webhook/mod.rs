//! Webhook publisher (C6) and dispatcher (C7): see spec §4.6/§4.7.

pub mod dispatcher;
pub mod model;
pub mod publisher;
pub mod signing;

pub use dispatcher::WebhookDispatcher;
pub use publisher::{NewEvent, WebhookPublisher};
