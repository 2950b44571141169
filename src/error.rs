use thiserror::Error;

/// 合并引擎错误
///
/// “瓦片不存在”不是错误，各层都用 Option 表达；
/// 这里只承载真正的 I/O、解码和配置失败。
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite 错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("对象存储错误: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("JSON 序列化失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("图像处理失败: {0}")]
    Image(#[from] image::ImageError),

    #[error("无效的瓦片数据: {0}")]
    InvalidTile(String),

    #[error("数据源无效: {0}")]
    InvalidSource(String),

    #[error("数据源 {0} 为只读，不支持写入")]
    SourceReadOnly(String),

    #[error("无效的批次游标 '{0}'")]
    InvalidCursor(String),
}
