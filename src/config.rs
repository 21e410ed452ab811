use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::service::scoring::{DEFAULT_DATE_WINDOW_DAYS, DEFAULT_REVIEW_FLOOR};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub matching: MatchingConfig,
    pub billing: BillingConfig,
    pub gateway: GatewayConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// 匹配策略中可调的部分；验收阈值 70 固定不可配
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub review_floor: u8,
    pub date_window_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// 同一批次内并发处理的订阅数
    pub concurrency: usize,
    /// 调度器检查间隔 (秒)；同一天只会完整跑一次
    pub scan_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// 导入后触发的匹配任务，最多同时处理的组织数
    pub match_workers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/bank_recon".to_string(),
                max_connections: 20,
            },
            matching: MatchingConfig {
                review_floor: DEFAULT_REVIEW_FLOOR,
                date_window_days: DEFAULT_DATE_WINDOW_DAYS,
            },
            billing: BillingConfig {
                concurrency: 4,
                scan_interval_secs: 3600,
            },
            gateway: GatewayConfig {
                base_url: "http://127.0.0.1:9090".to_string(),
                api_key: None,
                timeout_secs: 30,
            },
            jobs: JobsConfig { match_workers: 4 },
        }
    }
}

impl AppConfig {
    /// 加载配置：内置默认值 -> config/app.* 文件 (可选) -> APP__ 前缀环境变量
    ///
    /// 兼容旧的 DATABASE_URL / SERVER_HOST / SERVER_PORT 变量。
    pub fn load() -> AppResult<Self> {
        let defaults = Self::default();
        let settings = config::Config::builder()
            .set_default("server.host", defaults.server.host)
            .and_then(|b| b.set_default("server.port", i64::from(defaults.server.port)))
            .and_then(|b| b.set_default("database.url", defaults.database.url))
            .and_then(|b| {
                b.set_default(
                    "database.max_connections",
                    i64::from(defaults.database.max_connections),
                )
            })
            .and_then(|b| {
                b.set_default("matching.review_floor", i64::from(defaults.matching.review_floor))
            })
            .and_then(|b| {
                b.set_default("matching.date_window_days", defaults.matching.date_window_days)
            })
            .and_then(|b| b.set_default("billing.concurrency", defaults.billing.concurrency as i64))
            .and_then(|b| {
                b.set_default(
                    "billing.scan_interval_secs",
                    defaults.billing.scan_interval_secs as i64,
                )
            })
            .and_then(|b| b.set_default("gateway.base_url", defaults.gateway.base_url))
            .and_then(|b| {
                b.set_default("gateway.timeout_secs", defaults.gateway.timeout_secs as i64)
            })
            .and_then(|b| b.set_default("jobs.match_workers", defaults.jobs.match_workers as i64))
            .map(|b| {
                b.add_source(config::File::with_name("config/app").required(false))
                    .add_source(
                        config::Environment::with_prefix("APP")
                            .prefix_separator("__")
                            .separator("__")
                            .try_parsing(true),
                    )
            })
            .and_then(|b| b.set_override_option("database.url", std::env::var("DATABASE_URL").ok()))
            .and_then(|b| b.set_override_option("server.host", std::env::var("SERVER_HOST").ok()))
            .and_then(|b| {
                b.set_override_option(
                    "server.port",
                    std::env::var("SERVER_PORT")
                        .ok()
                        .and_then(|p| p.parse::<i64>().ok()),
                )
            })
            .and_then(|b| b.build())
            .map_err(|e| AppError::validation(format!("invalid configuration: {e}")))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| AppError::validation(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.billing.concurrency == 0 {
            return Err(AppError::validation("billing.concurrency must be at least 1"));
        }
        if self.jobs.match_workers == 0 {
            return Err(AppError::validation("jobs.match_workers must be at least 1"));
        }
        if self.gateway.timeout_secs == 0 {
            return Err(AppError::validation("gateway.timeout_secs must be positive"));
        }
        crate::service::MatchingPolicy::from(&self.matching).validate()
    }
}
