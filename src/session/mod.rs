//! Sticky-session tracking: session identifier to backend-key bindings.

mod table;

pub use table::{generate_session_id, Session, SessionTable};
