//! Configuration data types.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// One entry in the server list file: an upstream origin to register at startup.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
}

/// The server list is a bare JSON array of [`ServerEntry`] — no wrapping object.
pub type ServerList = Vec<ServerEntry>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}
