use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    /// 0 asks the OS for an ephemeral port
    pub port: u16,
    pub max_frame_size: usize,
    pub conn_read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 0,
            max_frame_size: 16 * 1024 * 1024,
            conn_read_buffer_size: 4 * 1024,
        }
    }
}

/// Where the bootstrap namer lives. Without an address this process hosts it
/// and becomes rank 0.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NamerConfig {
    pub addr: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub register_ms: u64,
    pub lookup_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            connect_ms: 10_000,
            register_ms: 10_000,
            lookup_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SenderConfig {
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// consecutive connect failures before the destination rank is declared failed
    pub max_connect_attempts: u32,
    /// failure declarations of one rank, without a successful connect in
    /// between, after which its messages are dropped instead of re-resolved
    pub max_reroutes: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            backoff_min_ms: 50,
            backoff_max_ms: 5_000,
            max_connect_attempts: 20,
            max_reroutes: 3,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig { interval_ms: 1_000 }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 0 means one worker per cpu
    pub worker_threads: usize,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MessengerConfig {
    pub network: NetworkConfig,
    pub namer: NamerConfig,
    pub timeouts: TimeoutConfig,
    pub sender: SenderConfig,
    pub reaper: ReaperConfig,
    pub runtime: RuntimeConfig,
}

impl MessengerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<MessengerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = ::config::Config::builder()
            .add_source(::config::File::with_name(path_str))
            .build()?;

        let messenger_config: MessengerConfig = config.try_deserialize()?;
        messenger_config.validate()?;
        Ok(messenger_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if let Some(addr) = &self.namer.addr {
            addr.parse::<SocketAddr>()
                .map_err(|e| AppError::InvalidValue(format!("namer addr {}: {}", addr, e)))?;
        }
        if self.sender.backoff_min_ms == 0 || self.sender.backoff_min_ms > self.sender.backoff_max_ms {
            return Err(AppError::InvalidValue(format!(
                "sender backoff range {}..{}",
                self.sender.backoff_min_ms, self.sender.backoff_max_ms
            )));
        }
        if self.network.max_frame_size < 64 {
            return Err(AppError::InvalidValue(format!(
                "max_frame_size {} is too small",
                self.network.max_frame_size
            )));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }

    pub fn namer_addr(&self) -> AppResult<Option<SocketAddr>> {
        self.namer
            .addr
            .as_ref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|e| AppError::InvalidValue(format!("namer addr {}: {}", addr, e)))
            })
            .transpose()
    }

    pub fn worker_threads(&self) -> usize {
        if self.runtime.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.runtime.worker_threads
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }
    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.register_ms)
    }
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.lookup_ms)
    }
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reaper.interval_ms)
    }
}
