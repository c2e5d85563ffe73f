//! atmosphere configuration

use clap::Parser;
use std::path::{Path, PathBuf};

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

/// Atmosphere mesh node
#[derive(Parser, Debug, Clone)]
#[command(name = "atmosphere")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Directory holding this node's identity, saved meshes, and caches.
    /// Defaults to `$HOME/.atmosphere` when unset.
    #[arg(long, env = "ATMOSPHERE_HOME")]
    pub home: Option<PathBuf>,

    /// STUN servers used for public endpoint discovery, comma-separated
    #[arg(long, env = "ATMOSPHERE_STUN_SERVERS", value_delimiter = ',')]
    pub stun_servers: Vec<String>,

    /// Relay servers to fall back to when direct/hole-punched paths fail, comma-separated
    #[arg(long, env = "ATMOSPHERE_RELAY_URLS", value_delimiter = ',')]
    pub relay_urls: Vec<String>,

    /// Log verbosity directive (falls back to RUST_LOG, then a built-in default)
    #[arg(long, env = "ATMOSPHERE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// LAN listen port for `serve`
    #[arg(long, default_value = "7420")]
    pub port: u16,

    /// Rate limit applied to inbound intent requests per peer, requests per minute
    #[arg(long, default_value = "600")]
    pub rate_limit_rpm: u32,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("--port must be nonzero");
        }
        for url in &self.relay_urls {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                anyhow::bail!("relay url {url:?} must start with ws:// or wss://");
            }
        }
        Ok(())
    }

    /// Resolved home directory: the configured value, or `$HOME/.atmosphere`.
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(|| dirs_home().join(".atmosphere"))
    }

    pub fn identity_key_path(&self) -> PathBuf {
        self.home_dir().join("identity.key")
    }

    pub fn meshes_path(&self) -> PathBuf {
        self.home_dir().join("meshes.json")
    }

    pub fn capabilities_path(&self) -> PathBuf {
        self.home_dir().join("capabilities.cbor")
    }

    pub fn gossip_cache_path(&self) -> PathBuf {
        self.home_dir().join("gossip_cache.cbor")
    }

    pub fn gossip_db_path(&self) -> PathBuf {
        self.home_dir().join("gossip.sled")
    }
}

/// Loads the node's Ed25519 identity, generating and persisting a fresh one
/// on first run. Stored as a bare 32-byte seed (§6), not a wrapped struct —
/// this node has nothing else worth caching alongside it: the mesh identity
/// *is* the node identity (see DESIGN.md, "mesh founder keypair").
pub fn load_or_create_identity(path: &Path) -> anyhow::Result<atmosphere_core::crypto::KeyPair> {
    use atmosphere_core::crypto::KeyPair;

    if path.exists() {
        let seed = std::fs::read(path)?;
        return Ok(KeyPair::from_seed(&seed)?);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let keypair = KeyPair::generate();
    std::fs::write(path, keypair.seed())?;
    Ok(keypair)
}
