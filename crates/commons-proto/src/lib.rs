//! Shared types for the Commons Radio playback engine.
//!
//! Everything that is not tied to a running daemon lives here: the wire
//! protocol spoken to UI clients, the playback session model, configuration,
//! the station catalog loaders, the preferences store, the playlist navigator
//! and the ICY now-playing extractor.

pub mod config;
pub mod error;
pub mod icy;
pub mod navigator;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod state;
pub mod store;
