//! Engine configuration, passed in by the external caller (§6). The
//! engine never loads this itself — no file parsing, no env vars, no
//! CLI flags; that plumbing belongs to an excluded outer layer.
use crate::peer::encryption::EncryptionMode;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub download_path: PathBuf,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub max_connections_per_torrent: usize,
    pub max_upload_speed: u64,
    pub max_download_speed: u64,
    pub port: u16,
    pub port_range: Vec<u16>,
    pub dht_enabled: bool,
    pub pex_enabled: bool,
    pub encryption_mode: EncryptionMode,
    pub verify_on_add: bool,
    pub start_on_add: bool,
    pub max_active_torrents: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("."),
            data_dir: PathBuf::from("."),
            max_connections: 200,
            max_connections_per_torrent: 50,
            max_upload_speed: 0,
            max_download_speed: 0,
            port: 6881,
            port_range: vec![6881, 6889],
            dht_enabled: false,
            pex_enabled: true,
            encryption_mode: EncryptionMode::Prefer,
            verify_on_add: true,
            start_on_add: true,
            max_active_torrents: 5,
        }
    }
}
