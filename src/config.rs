/*!
Typed configuration store.

Every module contributes a section with its own defaults; a missing file
or a missing section falls back to those defaults. The one value that
must survive a restart bit-exact is the monitor identifier used for loop
detection; when absent, a fresh one is generated and written back.
*/
use crate::clients::ClientsConfig;
use crate::error::MonitorError;
use crate::models::{Afi, BgpCapability, Safi};
use crate::periodic::PeriodicConfig;
use crate::session::{LabelAction, SessionConfig};
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// 32-bit identity of this monitor, persisted bit-exact.
    pub monitor_id: Option<u32>,
    pub peers: Vec<PeerEntry>,
    pub labeling: LabelingConfig,
    pub mrt: MrtConfig,
    pub periodic: PeriodicConfig,
    pub clients: ClientsConfig,
    pub chains: ChainsConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PeerEntry {
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub remote_as: u32,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub local_as: u32,
    pub local_bgp_id: Ipv4Addr,
    pub hold_time: u16,
    pub min_hold_time: u16,
    pub md5_password: Option<String>,
    pub label_action: LabelAction,
    pub route_refresh: bool,
    pub passive: bool,
    pub announce_route_refresh: bool,
    pub announce_four_octet_as: bool,
    pub connect_retry_secs: u64,
}

impl Default for PeerEntry {
    fn default() -> Self {
        PeerEntry {
            remote_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_port: 179,
            remote_as: 0,
            local_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 179,
            local_as: 0,
            local_bgp_id: Ipv4Addr::UNSPECIFIED,
            hold_time: 180,
            min_hold_time: 3,
            md5_password: None,
            label_action: LabelAction::Label,
            route_refresh: false,
            passive: false,
            announce_route_refresh: true,
            announce_four_octet_as: true,
            connect_retry_secs: 120,
        }
    }
}

impl PeerEntry {
    pub fn to_session_config(&self, labeling: &LabelingConfig) -> SessionConfig {
        let mut caps = vec![BgpCapability::multiprotocol(Afi::Ipv4, Safi::Unicast)];
        if self.announce_route_refresh {
            caps.push(BgpCapability::route_refresh());
        }
        if self.announce_four_octet_as {
            caps.push(BgpCapability::four_octet_as(self.local_as));
        }
        SessionConfig {
            local_addr: self.local_addr,
            local_port: self.local_port,
            local_as: self.local_as,
            local_bgp_id: u32::from(self.local_bgp_id),
            local_hold_time: self.hold_time,
            remote_addr: self.remote_addr,
            remote_port: self.remote_port,
            remote_as: self.remote_as,
            remote_min_hold_time: self.min_hold_time,
            collector_addr: None,
            md5_password: self.md5_password.clone(),
            label_action: self.label_action,
            route_refresh_action: self.route_refresh,
            passive: self.passive,
            connect_retry_secs: self.connect_retry_secs,
            announce_capabilities: caps,
            capability_requirements: Vec::new(),
            prefix_table_buckets: labeling.prefix_table_buckets,
            attr_table_buckets: labeling.attr_table_buckets,
            max_collision: labeling.max_collision,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LabelingConfig {
    pub prefix_table_buckets: usize,
    pub attr_table_buckets: usize,
    pub max_collision: u16,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        LabelingConfig {
            prefix_table_buckets: 1 << 16,
            attr_table_buckets: 1 << 14,
            max_collision: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MrtConfig {
    pub listen: SocketAddr,
    pub label_action: LabelAction,
}

impl Default for MrtConfig {
    fn default() -> Self {
        MrtConfig {
            listen: "0.0.0.0:50003".parse().expect("static address"),
            label_action: LabelAction::Label,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ChainsConfig {
    /// Seconds an owner entry lives without being refreshed.
    pub cache_entry_lifetime: u64,
}

impl Default for ChainsConfig {
    fn default() -> Self {
        ChainsConfig {
            cache_entry_lifetime: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ControlConfig {
    pub listen: SocketAddr,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            listen: "127.0.0.1:50000".parse().expect("static address"),
        }
    }
}

impl Config {
    /// Read the file, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Config, MonitorError> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| MonitorError::ConfigError(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no configuration at {}; using defaults", path.display());
                Ok(Config::default())
            }
            Err(e) => Err(MonitorError::ConfigError(format!(
                "{}: {e}",
                path.display()
            ))),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), MonitorError> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| MonitorError::ConfigError(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| MonitorError::ConfigError(format!("{}: {e}", path.display())))
    }

    /// The persisted monitor identity, generating (and persisting) a
    /// fresh one when the store has none yet.
    pub fn ensure_monitor_id(&mut self, path: &Path) -> u32 {
        match self.monitor_id {
            Some(id) => id,
            None => {
                let id: u32 = rand::thread_rng().gen();
                self.monitor_id = Some(id);
                if let Err(e) = self.save(path) {
                    warn!("generated monitor id {id:#010x} could not be persisted: {e}");
                }
                info!("generated monitor id {id:#010x}");
                id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load(Path::new("/nonexistent/bgpmon.toml")).unwrap();
        assert!(config.peers.is_empty());
        assert_eq!(config.periodic.route_refresh_interval, 7200);
    }

    #[test]
    fn test_roundtrip_preserves_monitor_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bgpmon.toml");
        let mut config = Config::default();
        let id = config.ensure_monitor_id(&path);
        // a reload sees the identical identifier
        let mut reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.ensure_monitor_id(&path), id);
    }

    #[test]
    fn test_parse_peer_section() {
        let text = r#"
            [[peers]]
            remote-addr = "192.0.2.1"
            remote-as = 65001
            local-as = 64512
            local-bgp-id = "192.0.2.254"
            label-action = "label"
            route-refresh = true
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(peer.remote_as, 65001);
        assert_eq!(peer.remote_port, 179);
        let session_config = peer.to_session_config(&config.labeling);
        assert_eq!(session_config.local_bgp_id, u32::from(Ipv4Addr::new(192, 0, 2, 254)));
        assert!(session_config.route_refresh_action);
        assert_eq!(session_config.announce_capabilities.len(), 3);
    }
}
