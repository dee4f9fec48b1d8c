//! Request forwarding to backends.

mod forwarder;

pub use forwarder::{Forwarder, ForwarderError};
