// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Process configuration, loaded once at startup from a single JSON file via
//! the `config` crate. Field names and defaults follow the original's
//! `postgres`/`redis`/`beanstalkd` stanzas; `http`, `logging`, and
//! `gatekeeper` are additions this runtime needs that the distilled schema
//! didn't carry a slot for.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::CreationError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresConfig {
    pub conn_str: String,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout: u64,
    #[serde(default = "default_postgres_pool_limit")]
    pub max_conn_per_worker: usize,
    /// `-1` means unlimited; a device is recycled once it has served this
    /// many queries otherwise.
    #[serde(default = "default_unlimited")]
    pub min_queries_per_conn: i64,
    #[serde(default = "default_unlimited")]
    pub max_queries_per_conn: i64,
    #[serde(default)]
    pub post_connect_queries: Vec<String>,
}

fn default_statement_timeout() -> u64 { 300 }
fn default_postgres_pool_limit() -> usize { 20 }
fn default_unlimited() -> i64 { -1 }

impl PostgresConfig {
    pub fn statement_timeout(&self) -> Duration { Duration::from_secs(self.statement_timeout) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// `-1` means no `SELECT` is issued after connecting (database 0).
    #[serde(default = "default_redis_database")]
    pub database: i32,
    #[serde(default = "default_redis_pool_limit")]
    pub max_conn_per_worker: usize,
}

fn default_redis_port() -> u16 { 6379 }
fn default_redis_database() -> i32 { -1 }
fn default_redis_pool_limit() -> usize { 50 }

impl RedisConfig {
    pub fn url(&self) -> String {
        let db = if self.database >= 0 { self.database } else { 0 };
        format!("redis://{}:{}/{}", self.host, self.port, db)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeanstalkdConfig {
    pub host: String,
    #[serde(default = "default_beanstalkd_port")]
    pub port: u16,
    #[serde(default = "default_beanstalkd_timeout")]
    pub timeout: f64,
    pub tubes: Vec<String>,
}

fn default_beanstalkd_port() -> u16 { 11300 }
fn default_beanstalkd_timeout() -> f64 { 5.0 }

impl BeanstalkdConfig {
    pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }
    pub fn timeout(&self) -> Duration { Duration::from_secs_f64(self.timeout) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_http_pool_limit")]
    pub pool_limit: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_http_pool_limit() -> usize { 100 }
fn default_http_timeout_ms() -> u64 { 5_000 }

impl HttpConfig {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path logs are written to; `None` means stdout. `SIGUSR1` reopens this
    /// path, which is what makes external log rotation (logrotate, etc.)
    /// safe to run against it.
    pub path: Option<String>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: default_log_level(), path: None }
    }
}

/// One routing rule: a compiled-at-load-time regex matched against the
/// request path, restricted to a method set (empty means "any method") and
/// gated by a role bitmask (`0` means "no role required").
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatekeeperRule {
    pub pattern: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub role_mask: u64,
    /// When set, a matching request is deflected to a beanstalkd tube
    /// instead of being executed inline.
    pub job: Option<GatekeeperJob>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatekeeperJob {
    pub tube: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GatekeeperConfig {
    #[serde(default)]
    pub rules: Vec<GatekeeperRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory the inbox socket and pid file are created in; see
    /// `Config::inbox_socket_path` / `Config::pid_file_path`.
    #[serde(default = "default_run_dir")]
    pub run_dir: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub gatekeeper: GatekeeperConfig,
    pub redis: Option<RedisConfig>,
    pub postgres: Option<PostgresConfig>,
    pub http: Option<HttpConfig>,
    pub beanstalkd: Option<BeanstalkdConfig>,
    /// Catch-all for deployment-specific values application code above this
    /// crate cares about but the runtime itself never interprets.
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_run_dir() -> String { "/var/run/evrt".to_string() }

impl Config {
    /// Loads configuration from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Config, CreationError> {
        let source = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .build()
            .map_err(|e| CreationError::InvalidValue { field: "config_file", reason: e.to_string() })?;

        let config: Config = source
            .try_deserialize()
            .map_err(|e| CreationError::InvalidValue { field: "config_file", reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CreationError> {
        if self.redis.is_none() && self.postgres.is_none() && self.http.is_none() {
            return Err(CreationError::InvalidValue {
                field: "backends",
                reason: "at least one of redis, postgres, or http must be configured".to_string(),
            });
        }
        Ok(())
    }

    /// `<run_dir>/<instance>.pid`.
    pub fn pid_file_path(&self, instance: u32) -> PathBuf {
        Path::new(&self.run_dir).join(format!("{instance}.pid"))
    }

    /// `<run_dir>/ev-scheduler-<pid>.socket`.
    pub fn inbox_socket_path(&self, pid: u32) -> PathBuf {
        Path::new(&self.run_dir).join(format!("ev-scheduler-{pid}.socket"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_config() {
        let file = write_config(
            r#"{
                "redis": { "host": "127.0.0.1" }
            }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.run_dir, "/var/run/evrt");
        let redis = config.redis.unwrap();
        assert_eq!(redis.max_conn_per_worker, 50);
        assert_eq!(redis.url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn rejects_config_with_no_backends() {
        let file = write_config(r#"{ "run_dir": "/tmp/evrt" }"#);
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let file = write_config(
            r#"{
                "redis": { "host": "127.0.0.1", "bogus_field": true }
            }"#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn derives_run_dir_paths() {
        let file = write_config(r#"{ "run_dir": "/tmp/evrt", "redis": { "host": "127.0.0.1" } }"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.pid_file_path(3), PathBuf::from("/tmp/evrt/3.pid"));
        assert_eq!(config.inbox_socket_path(1234), PathBuf::from("/tmp/evrt/ev-scheduler-1234.socket"));
    }
}
