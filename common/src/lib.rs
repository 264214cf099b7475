//! Types shared by the `writer` and `reader` demo binaries.
//!
//! Both binaries must name the exact same record type: the engine derives
//! the region path from the type's identity, and that identity is the only
//! coordination key between processes.

use serde_derive::{Deserialize, Serialize};

use shstate::SyncConfig;

/// The record the demos synchronize across processes.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoState {
    pub message: String,
    pub count: u64,
    pub position: Position,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

/// On-disk configuration for the demo binaries, loaded with `confy`.
///
/// `message` and `count` seed the initial record; `sync` is passed through
/// to the engine unchanged.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    pub message: String,
    pub count: u64,
    pub sync: SyncConfig,
}
