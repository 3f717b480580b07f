use anyhow::{Context, Result};
use directories::ProjectDirs;
use roomnet_core::control::NodeConfig;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "roomnet-node.toml";

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("net", "roomnet", "roomnet")
        .context("could not determine platform config directory")?;
    let dir = proj.config_dir();
    Ok(dir.join(CONFIG_FILE_NAME))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<NodeConfig> {
    if !path.exists() {
        return Ok(NodeConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: NodeConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &NodeConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomnet_core::transport::PeerId;
    use std::net::Ipv4Addr;

    #[test]
    fn test_default_config_roundtrips_through_toml() {
        let cfg = NodeConfig::default();
        let raw = toml::to_string_pretty(&cfg).expect("serialize failed");
        let parsed: NodeConfig = toml::from_str(&raw).expect("parse failed");

        assert_eq!(parsed.self_id, cfg.self_id);
        assert_eq!(parsed.address, cfg.address);
        assert_eq!(parsed.listen_port, cfg.listen_port);
        assert_eq!(parsed.poll.max_interval_us, cfg.poll.max_interval_us);
    }

    #[test]
    fn test_roster_roundtrips_through_toml() {
        let mut cfg = NodeConfig::default();
        cfg.peers.push(roomnet_core::control::PeerEntry {
            id: PeerId::from_raw(202),
            endpoint: "198.51.100.7:48700".parse().unwrap(),
            address: Ipv4Addr::new(10, 77, 0, 2),
        });

        let raw = toml::to_string_pretty(&cfg).expect("serialize failed");
        let parsed: NodeConfig = toml::from_str(&raw).expect("parse failed");

        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].id, PeerId::from_raw(202));
        assert_eq!(parsed.peers[0].address, Ipv4Addr::new(10, 77, 0, 2));
    }
}
