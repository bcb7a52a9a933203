use std::path::{Path, PathBuf};

use clap::Parser;
use common_broker::BrokerConfig;
use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

pub const CONFIG_FILE_NAME: &str = "cache_db_service_cfg.json";

/// CLI surface: every recognized config key is accepted as `--<key>` and
/// wins over the file.
#[derive(Parser, Debug, Default)]
#[command(name = "cache-ingest", about = "Cache front edge staging database jobs for the queue")]
pub struct Args {
    /// Path to the JSON configuration file.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    #[arg(long = "service_title")]
    pub service_title: Option<String>,
    #[arg(long = "log_root_path")]
    pub log_root_path: Option<String>,
    #[arg(long = "write_file")]
    pub write_file: Option<String>,
    #[arg(long = "write_console")]
    pub write_console: Option<String>,
    #[arg(long = "write_interval")]
    pub write_interval: Option<u64>,

    #[arg(long = "high_priority_count")]
    pub high_priority_count: Option<usize>,
    #[arg(long = "normal_priority_count")]
    pub normal_priority_count: Option<usize>,
    #[arg(long = "low_priority_count")]
    pub low_priority_count: Option<usize>,

    #[arg(long = "redis_host")]
    pub redis_host: Option<String>,
    #[arg(long = "redis_port")]
    pub redis_port: Option<u16>,
    #[arg(long = "redis_db_index")]
    pub redis_db_index: Option<i64>,
    #[arg(long = "redis_stream_key")]
    pub redis_stream_key: Option<String>,
    #[arg(long = "redis_group_name")]
    pub redis_group_name: Option<String>,
    #[arg(long = "redis_consumer_name")]
    pub redis_consumer_name: Option<String>,
    #[arg(long = "redis_block_ms")]
    pub redis_block_ms: Option<u64>,
    #[arg(long = "redis_count")]
    pub redis_count: Option<usize>,
    #[arg(long = "redis_auto_create_group")]
    pub redis_auto_create_group: Option<bool>,
    #[arg(long = "redis_reconnect_max_retries")]
    pub redis_reconnect_max_retries: Option<u32>,
    #[arg(long = "redis_reconnect_interval_ms")]
    pub redis_reconnect_interval_ms: Option<u64>,

    #[arg(long = "rabbit_mq_host", alias = "rabbit_host")]
    pub rabbit_mq_host: Option<String>,
    #[arg(long = "rabbit_mq_port", alias = "rabbit_port")]
    pub rabbit_mq_port: Option<u16>,
    #[arg(long = "rabbit_mq_user_name", alias = "rabbit_user")]
    pub rabbit_mq_user_name: Option<String>,
    #[arg(long = "rabbit_mq_password", alias = "rabbit_password")]
    pub rabbit_mq_password: Option<String>,
    #[arg(long = "rabbit_heartbeat")]
    pub rabbit_heartbeat: Option<u16>,
    #[arg(long = "rabbit_channel_id")]
    pub rabbit_channel_id: Option<u16>,
    #[arg(long = "publish_queue_name")]
    pub publish_queue_name: Option<String>,
    #[arg(long = "content_type")]
    pub content_type: Option<String>,
    #[arg(long = "message_ttl_ms")]
    pub message_ttl_ms: Option<u32>,
    #[arg(long = "rabbit_mq_reconnect_max_retries")]
    pub rabbit_mq_reconnect_max_retries: Option<u32>,
    #[arg(long = "rabbit_mq_reconnect_interval_ms")]
    pub rabbit_mq_reconnect_interval_ms: Option<u64>,

    #[arg(long = "publish_to_main_db_service_interval_ms")]
    pub publish_to_main_db_service_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_service_title")]
    pub service_title: String,
    #[serde(default)]
    pub log_root_path: String,
    #[serde(default = "default_write_file")]
    pub write_file: String,
    #[serde(default = "default_write_console")]
    pub write_console: String,
    #[serde(default = "default_write_interval")]
    pub write_interval: u64,

    #[serde(default = "default_worker_count")]
    pub high_priority_count: usize,
    #[serde(default = "default_worker_count")]
    pub normal_priority_count: usize,
    #[serde(default = "default_worker_count")]
    pub low_priority_count: usize,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,
    #[serde(default)]
    pub redis_db_index: i64,
    /// Empty disables the stream-consume mode; the direct enqueue API is
    /// the primary write path.
    #[serde(default)]
    pub redis_stream_key: String,
    #[serde(default = "default_redis_group")]
    pub redis_group_name: String,
    #[serde(default = "default_redis_consumer")]
    pub redis_consumer_name: String,
    #[serde(default = "default_redis_block_ms")]
    pub redis_block_ms: u64,
    #[serde(default = "default_redis_count")]
    pub redis_count: usize,
    #[serde(default = "default_true")]
    pub redis_auto_create_group: bool,
    #[serde(default = "default_reconnect_retries")]
    pub redis_reconnect_max_retries: u32,
    #[serde(default = "default_reconnect_interval_ms")]
    pub redis_reconnect_interval_ms: u64,

    #[serde(default = "default_rabbit_host", alias = "rabbit_host")]
    pub rabbit_mq_host: String,
    #[serde(default = "default_rabbit_port", alias = "rabbit_port")]
    pub rabbit_mq_port: u16,
    #[serde(default = "default_rabbit_user", alias = "rabbit_user")]
    pub rabbit_mq_user_name: String,
    #[serde(default = "default_rabbit_password", alias = "rabbit_password")]
    pub rabbit_mq_password: String,
    #[serde(default = "default_rabbit_heartbeat")]
    pub rabbit_heartbeat: u16,
    #[serde(default = "default_rabbit_channel_id")]
    pub rabbit_channel_id: u16,
    #[serde(default = "default_publish_queue_name")]
    pub publish_queue_name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub message_ttl_ms: Option<u32>,
    #[serde(default = "default_reconnect_retries")]
    pub rabbit_mq_reconnect_max_retries: u32,
    #[serde(default = "default_reconnect_interval_ms")]
    pub rabbit_mq_reconnect_interval_ms: u64,

    #[serde(default = "default_publish_interval_ms")]
    pub publish_to_main_db_service_interval_ms: u64,
}

fn default_service_title() -> String {
    "cache-ingest".to_string()
}
fn default_write_file() -> String {
    "none".to_string()
}
fn default_write_console() -> String {
    "information".to_string()
}
fn default_write_interval() -> u64 {
    1000
}
fn default_worker_count() -> usize {
    1
}
fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_redis_group() -> String {
    "cache-writers".to_string()
}
fn default_redis_consumer() -> String {
    "cache-writer-1".to_string()
}
fn default_redis_block_ms() -> u64 {
    1000
}
fn default_redis_count() -> usize {
    50
}
fn default_true() -> bool {
    true
}
fn default_reconnect_retries() -> u32 {
    3
}
fn default_reconnect_interval_ms() -> u64 {
    1000
}
fn default_rabbit_host() -> String {
    "127.0.0.1".to_string()
}
fn default_rabbit_port() -> u16 {
    5672
}
fn default_rabbit_user() -> String {
    "guest".to_string()
}
fn default_rabbit_password() -> String {
    "guest".to_string()
}
fn default_rabbit_heartbeat() -> u16 {
    60
}
fn default_rabbit_channel_id() -> u16 {
    1
}
fn default_publish_queue_name() -> String {
    "db.write".to_string()
}
fn default_content_type() -> String {
    "application/json".to_string()
}
fn default_publish_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

impl Config {
    /// File (when present) then CLI, CLI winning.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut config = match resolve_config_path(args) {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(args);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    fn apply_overrides(&mut self, args: &Args) {
        override_field(&mut self.service_title, &args.service_title);
        override_field(&mut self.log_root_path, &args.log_root_path);
        override_field(&mut self.write_file, &args.write_file);
        override_field(&mut self.write_console, &args.write_console);
        override_field(&mut self.write_interval, &args.write_interval);
        override_field(&mut self.high_priority_count, &args.high_priority_count);
        override_field(&mut self.normal_priority_count, &args.normal_priority_count);
        override_field(&mut self.low_priority_count, &args.low_priority_count);
        override_field(&mut self.redis_host, &args.redis_host);
        override_field(&mut self.redis_port, &args.redis_port);
        override_field(&mut self.redis_db_index, &args.redis_db_index);
        override_field(&mut self.redis_stream_key, &args.redis_stream_key);
        override_field(&mut self.redis_group_name, &args.redis_group_name);
        override_field(&mut self.redis_consumer_name, &args.redis_consumer_name);
        override_field(&mut self.redis_block_ms, &args.redis_block_ms);
        override_field(&mut self.redis_count, &args.redis_count);
        override_field(&mut self.redis_auto_create_group, &args.redis_auto_create_group);
        override_field(
            &mut self.redis_reconnect_max_retries,
            &args.redis_reconnect_max_retries,
        );
        override_field(
            &mut self.redis_reconnect_interval_ms,
            &args.redis_reconnect_interval_ms,
        );
        override_field(&mut self.rabbit_mq_host, &args.rabbit_mq_host);
        override_field(&mut self.rabbit_mq_port, &args.rabbit_mq_port);
        override_field(&mut self.rabbit_mq_user_name, &args.rabbit_mq_user_name);
        override_field(&mut self.rabbit_mq_password, &args.rabbit_mq_password);
        override_field(&mut self.rabbit_heartbeat, &args.rabbit_heartbeat);
        override_field(&mut self.rabbit_channel_id, &args.rabbit_channel_id);
        override_field(&mut self.publish_queue_name, &args.publish_queue_name);
        override_field(&mut self.content_type, &args.content_type);
        override_field(
            &mut self.rabbit_mq_reconnect_max_retries,
            &args.rabbit_mq_reconnect_max_retries,
        );
        override_field(
            &mut self.rabbit_mq_reconnect_interval_ms,
            &args.rabbit_mq_reconnect_interval_ms,
        );
        override_field(
            &mut self.publish_to_main_db_service_interval_ms,
            &args.publish_to_main_db_service_interval_ms,
        );
        if args.message_ttl_ms.is_some() {
            self.message_ttl_ms = args.message_ttl_ms;
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.rabbit_mq_host.clone(),
            port: self.rabbit_mq_port,
            username: self.rabbit_mq_user_name.clone(),
            password: self.rabbit_mq_password.clone(),
            heartbeat_secs: self.rabbit_heartbeat,
            channel_id: self.rabbit_channel_id,
        }
    }

    /// Per-message TTL for published jobs; 0 means no expiry.
    pub fn publish_ttl_ms(&self) -> Option<u32> {
        self.message_ttl_ms.filter(|ttl| *ttl > 0)
    }

    pub fn stream_mode_enabled(&self) -> bool {
        !self.redis_stream_key.is_empty()
    }

    pub fn console_level(&self) -> LevelFilter {
        parse_log_level(&self.write_console)
    }

    pub fn file_level(&self) -> LevelFilter {
        parse_log_level(&self.write_file)
    }
}

fn override_field<T: Clone>(field: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *field = value.clone();
    }
}

fn resolve_config_path(args: &Args) -> Option<PathBuf> {
    if let Some(path) = &args.config {
        return Some(path.clone());
    }
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join(CONFIG_FILE_NAME))
}

pub fn parse_log_level(value: &str) -> LevelFilter {
    match value.to_ascii_lowercase().as_str() {
        "none" | "off" => LevelFilter::OFF,
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warning" | "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.redis_host, "127.0.0.1");
        assert_eq!(config.redis_port, 6379);
        assert_eq!(config.publish_queue_name, "db.write");
        assert_eq!(config.content_type, "application/json");
        assert_eq!(config.publish_to_main_db_service_interval_ms, 1000);
        assert!(!config.stream_mode_enabled());
    }

    #[test]
    fn stream_mode_follows_the_stream_key() {
        let config: Config =
            serde_json::from_str(r#"{"redis_stream_key":"cache:changes"}"#).unwrap();
        assert!(config.stream_mode_enabled());
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let mut config: Config = serde_json::from_str(
            r#"{"rabbit_mq_host":"from-file","publish_to_main_db_service_interval_ms":5000}"#,
        )
        .unwrap();
        let args = Args {
            rabbit_mq_host: Some("from-cli".to_string()),
            redis_reconnect_max_retries: Some(0),
            ..Default::default()
        };
        config.apply_overrides(&args);
        assert_eq!(config.rabbit_mq_host, "from-cli");
        assert_eq!(config.publish_to_main_db_service_interval_ms, 5000);
        assert_eq!(config.redis_reconnect_max_retries, 0);
    }

    #[test]
    fn zero_publish_ttl_means_no_expiry() {
        let config: Config = serde_json::from_str(r#"{"message_ttl_ms":0}"#).unwrap();
        assert_eq!(config.publish_ttl_ms(), None);
        let config: Config = serde_json::from_str(r#"{"message_ttl_ms":1500}"#).unwrap();
        assert_eq!(config.publish_ttl_ms(), Some(1500));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"redis_hostname":"x"}"#).is_err());
    }
}
