//! Backend pool tracking and selection.

mod registry;
mod selector;

pub use registry::{Backend, BackendError, BackendSnapshot, Registry};
pub use selector::{Algorithm, SelectError, Selector};
