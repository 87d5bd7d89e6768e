//! Core per-torrent BitTorrent engine: bencode codec, tracker
//! coordination (HTTP + UDP), peer wire protocol with MSE/PE
//! encryption, and piece/session orchestration.
//!
//! Everything above the `DiskManager` boundary lives here; disk layout,
//! process supervision, and any CLI/UI front-end are owned elsewhere.
pub mod bandwidth;
pub mod bencode;
pub mod choking;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod session;
pub mod tracker;

pub use config::EngineConfig;
pub use engine::{Engine, TorrentStats};
pub use error::{Error, Result};
pub use events::EngineEvent;
