//! 进程级配置
//!
//! 配置文件为 JSON，路径取环境变量 TILE_MERGER_CONFIG，默认 config.json；
//! 文件缺失时全部走默认值。核心库不读全局配置，由入口把值传进来。

use crate::types::TileFormat;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// 工作线程数
    pub worker_count: usize,
    /// 合并后是否做目标校验
    pub validate: bool,
    /// 除瓦片数外，批次累计字节数的上限（None 不限制）
    pub max_batch_bytes: Option<u64>,
    /// GPKG 目标收尾时是否 VACUUM
    pub gpkg_vacuum: bool,
    /// 合并输出的瓦片格式
    pub target_format: TileFormat,
    /// HTTP 源请求超时（秒）
    pub http_timeout_secs: u64,
    /// S3 端点覆盖（MinIO 等自建服务），None 走 AWS 环境配置
    pub s3_endpoint: Option<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            validate: true,
            max_batch_bytes: None,
            gpkg_vacuum: false,
            target_format: TileFormat::Png,
            http_timeout_secs: 30,
            s3_endpoint: None,
        }
    }
}

impl MergeConfig {
    pub fn load() -> Self {
        let path = std::env::var("TILE_MERGER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.json"));

        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => {
                    log::info!("已加载配置文件 {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("配置文件 {} 解析失败，使用默认配置: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

pub static CONFIG: Lazy<MergeConfig> = Lazy::new(MergeConfig::load);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MergeConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.target_format, TileFormat::Png);
        assert!(config.max_batch_bytes.is_none());
    }

    #[test]
    fn test_partial_json() {
        let config: MergeConfig =
            serde_json::from_str(r#"{"worker_count": 8, "validate": false}"#).unwrap();
        assert_eq!(config.worker_count, 8);
        assert!(!config.validate);
        assert_eq!(config.target_format, TileFormat::Png);
    }
}
