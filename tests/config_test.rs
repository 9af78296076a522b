//! Configuration clamping tests
//!
//! Run with: cargo test --test config_test

use parlor::config::Config;
use std::sync::Mutex;

// Environment variables are process-global; serialize the tests touching them.
static ENV_LOCK: Mutex<()> = Mutex::new(());

const KEYS: &[&str] = &[
    "PORT",
    "MAX_USERS_PER_ROOM",
    "MAX_ROOMS",
    "CHAT_HISTORY_SIZE",
    "UDP_MIN",
    "UDP_MAX",
    "PUBLIC_IP",
    "PUBLIC_IP_RECHECK_INTERVAL",
    "TRUST_PROXY",
    "ALLOWED_ORIGINS",
];

fn clear_env() {
    for key in KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

fn set_env(key: &str, value: &str) {
    unsafe { std::env::set_var(key, value) };
}

#[test]
fn test_defaults() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let config = Config::from_env();
    assert_eq!(config.port, 17223);
    assert_eq!(config.max_users_per_room, 25);
    assert_eq!(config.max_rooms, 100);
    assert_eq!(config.chat_history_size, 200);
    assert_eq!(config.udp_min, 40000);
    assert_eq!(config.udp_max, 40100);
    assert_eq!(config.public_ip, None);
    assert_eq!(config.public_ip_recheck_secs, 0);
    assert!(!config.trust_proxy);
    assert!(config.allowed_origins.is_empty());
}

#[test]
fn test_out_of_range_values_are_clamped() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    set_env("MAX_USERS_PER_ROOM", "5000");
    set_env("MAX_ROOMS", "0");
    set_env("CHAT_HISTORY_SIZE", "3");

    let config = Config::from_env();
    assert_eq!(config.max_users_per_room, 100);
    assert_eq!(config.max_rooms, 1);
    assert_eq!(config.chat_history_size, 10);
    clear_env();
}

#[test]
fn test_inverted_udp_range_is_swapped() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    set_env("UDP_MIN", "50100");
    set_env("UDP_MAX", "50000");

    let config = Config::from_env();
    assert_eq!(config.udp_min, 50000);
    assert_eq!(config.udp_max, 50100);
    clear_env();
}

#[test]
fn test_origin_list_and_proxy_flag() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    set_env("ALLOWED_ORIGINS", "https://a.example, https://b.example ,");
    set_env("TRUST_PROXY", "true");

    let config = Config::from_env();
    assert_eq!(
        config.allowed_origins,
        vec!["https://a.example".to_string(), "https://b.example".to_string()]
    );
    assert!(config.trust_proxy);
    clear_env();
}

#[tokio::test]
async fn test_literal_public_ip_resolves_without_dns() {
    let config = {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        set_env("PUBLIC_IP", "198.51.100.7");
        let config = Config::from_env();
        clear_env();
        config
    };
    let ip = config.resolve_public_ip().await.expect("literal IP");
    assert_eq!(ip.to_string(), "198.51.100.7");
}
