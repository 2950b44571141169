//! 栅格瓦片金字塔合并库
//!
//! 把多个数据源（GPKG / 目录 / S3 / XYZ / TMS / WMTS）的瓦片
//! 按优先级合成进一个目标金字塔，支持网格与原点约定转换、
//! 祖先瓦片回退和可恢复的批次进度。

pub mod config;
pub mod error;
pub mod geo;
pub mod grid;
pub mod merge;
pub mod process;
pub mod sources;
pub mod status;
pub mod types;

pub use error::MergeError;
