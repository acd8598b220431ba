//! Retrace Engine - the recording session
//!
//! Wires capture, encoding and the attempt ledger together behind the
//! small API the host's event hooks call: start and stop a session, record
//! attempts, and export the recent attempts as a clip.

pub mod engine;
mod forward;
pub mod naming;

pub use engine::{Engine, EngineStats, ExportHandle};
pub use naming::{sanitize_label, suggested_filename};
