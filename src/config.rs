//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__WORKFLOW__MAX_CONCURRENCY=4`）。
//! 所有字段都有默认值，空配置也是合法配置。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub workflow: WorkflowSection,
    pub router: RouterSection,
    pub recovery: RecoverySection,
    pub tools: ToolsSection,
    pub reflection: ReflectionSection,
}

/// [app] 段：应用名、每次请求检索的记忆条数、系统提示词
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
    pub system_prompt: Option<String>,
}

fn default_memory_limit() -> usize {
    10
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            memory_limit: default_memory_limit(),
            system_prompt: None,
        }
    }
}

/// [workflow] 段：失败比例阈值、每层并发上限、并行组默认超时
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    /// 单层失败数 ≤ 总数 × 该比例时继续执行后续层级
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    pub default_parallel_timeout_secs: Option<f64>,
}

fn default_max_failure_ratio() -> f64 {
    0.5
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_failure_ratio: default_max_failure_ratio(),
            max_concurrency: default_max_concurrency(),
            default_parallel_timeout_secs: None,
        }
    }
}

/// [router] 段：决策缓存容量与长短请求阈值（字符数）
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_short_request_chars")]
    pub short_request_chars: usize,
    #[serde(default = "default_long_request_chars")]
    pub long_request_chars: usize,
}

fn default_cache_size() -> usize {
    100
}

fn default_short_request_chars() -> usize {
    15
}

fn default_long_request_chars() -> usize {
    200
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            short_request_chars: default_short_request_chars(),
            long_request_chars: default_long_request_chars(),
        }
    }
}

/// [recovery] 段：各类错误的重试 / 降级次数上限
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_tool_max_retries")]
    pub tool_max_retries: u32,
    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,
    #[serde(default = "default_unknown_max_downgrades")]
    pub unknown_max_downgrades: u32,
}

fn default_tool_max_retries() -> u32 {
    3
}

fn default_llm_max_retries() -> u32 {
    2
}

fn default_unknown_max_downgrades() -> u32 {
    1
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            tool_max_retries: default_tool_max_retries(),
            llm_max_retries: default_llm_max_retries(),
            unknown_max_downgrades: default_unknown_max_downgrades(),
        }
    }
}

/// [tools] 段：单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [reflection] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ReflectionSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for ReflectionSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.memory_limit, 10);
        assert!((cfg.workflow.max_failure_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.workflow.max_concurrency, 8);
        assert_eq!(cfg.router.cache_size, 100);
        assert_eq!(cfg.router.short_request_chars, 15);
        assert_eq!(cfg.recovery.tool_max_retries, 3);
        assert_eq!(cfg.recovery.llm_max_retries, 2);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.reflection.max_attempts, 3);
    }

    #[test]
    fn test_load_explicit_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[workflow]\nmax_concurrency = 2\n\n[router]\ncache_size = 5\n\n[recovery]\ntool_max_retries = 1"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.workflow.max_concurrency, 2);
        assert_eq!(cfg.router.cache_size, 5);
        assert_eq!(cfg.recovery.tool_max_retries, 1);
        // 未写的键保持默认
        assert_eq!(cfg.recovery.llm_max_retries, 2);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let cfg = load_config(Some(PathBuf::from("/nonexistent/hive.toml"))).unwrap();
        assert!(cfg.workflow.max_concurrency >= 1);
    }
}
