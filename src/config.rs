//! Environment configuration with clamped tunables.
//!
//! Environment variables:
//! - `PORT` — WebSocket listen port (default: 17223)
//! - `MAX_USERS_PER_ROOM` — occupancy cap across a main room and its subs (default: 25, 1..100)
//! - `MAX_ROOMS` — total main-room cap (default: 100, 1..10000)
//! - `CHAT_HISTORY_SIZE` — per-room chat ring capacity (default: 200, 10..1000)
//! - `UDP_MIN` / `UDP_MAX` — ICE ephemeral UDP port range (default: 40000..40100)
//! - `PUBLIC_IP` — literal IP or hostname advertised via NAT 1-to-1 (default: unset)
//! - `PUBLIC_IP_RECHECK_INTERVAL` — seconds between re-resolutions, 0 disables (default: 0)
//! - `TRUST_PROXY` — honor X-Forwarded-For / X-Real-IP (default: false)
//! - `ALLOWED_ORIGINS` — comma list; empty means same-origin against Host (default: empty)

use std::env;
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_users_per_room: usize,
    pub max_rooms: usize,
    pub chat_history_size: usize,
    pub udp_min: u16,
    pub udp_max: u16,
    pub public_ip: Option<String>,
    pub public_ip_recheck_secs: u64,
    pub trust_proxy: bool,
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 17223,
            max_users_per_room: 25,
            max_rooms: 100,
            chat_history_size: 200,
            udp_min: 40000,
            udp_max: 40100,
            public_ip: None,
            public_ip_recheck_secs: 0,
            trust_proxy: false,
            allowed_origins: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match env::var(key) {
        Ok(val) => val.trim().parse::<T>().ok(),
        Err(_) => None,
    }
}

fn clamp(value: usize, lo: usize, hi: usize) -> usize {
    value.max(lo).min(hi)
}

impl Config {
    /// Read every tunable from the environment, clamping out-of-range values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("PORT") {
            if port != 0 {
                config.port = port;
            }
        }
        if let Some(n) = env_parse::<usize>("MAX_USERS_PER_ROOM") {
            config.max_users_per_room = clamp(n, 1, 100);
        }
        if let Some(n) = env_parse::<usize>("MAX_ROOMS") {
            config.max_rooms = clamp(n, 1, 10_000);
        }
        if let Some(n) = env_parse::<usize>("CHAT_HISTORY_SIZE") {
            config.chat_history_size = clamp(n, 10, 1_000);
        }
        if let Some(n) = env_parse::<u16>("UDP_MIN") {
            config.udp_min = n;
        }
        if let Some(n) = env_parse::<u16>("UDP_MAX") {
            config.udp_max = n;
        }
        if config.udp_min > config.udp_max {
            std::mem::swap(&mut config.udp_min, &mut config.udp_max);
        }
        if let Ok(val) = env::var("PUBLIC_IP") {
            let val = val.trim().to_string();
            if !val.is_empty() {
                config.public_ip = Some(val);
            }
        }
        if let Some(n) = env_parse::<u64>("PUBLIC_IP_RECHECK_INTERVAL") {
            config.public_ip_recheck_secs = n;
        }
        if let Ok(val) = env::var("TRUST_PROXY") {
            config.trust_proxy = matches!(val.trim(), "1" | "true" | "yes" | "on");
        }
        if let Ok(val) = env::var("ALLOWED_ORIGINS") {
            config.allowed_origins = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config
    }

    /// Resolve `PUBLIC_IP` to an address: literal IPs pass through, hostnames
    /// go through DNS with IPv4 preferred.
    pub async fn resolve_public_ip(&self) -> Option<IpAddr> {
        let host = self.public_ip.as_deref()?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        // lookup_host needs a port; any will do.
        let addrs: Vec<IpAddr> = match tokio::net::lookup_host((host, 0)).await {
            Ok(iter) => iter.map(|a| a.ip()).collect(),
            Err(e) => {
                tracing::warn!("Failed to resolve PUBLIC_IP '{}': {}", host, e);
                return None;
            }
        };
        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
    }
}
