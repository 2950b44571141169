use crate::error::MergeError;
use serde::{Deserialize, Serialize};

/// 瓦片坐标
///
/// 合并引擎内部统一使用 2x1 网格 + 左下角原点，
/// 其他约定的坐标在进出后端时转换。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub z: i32,
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub fn new(z: i32, x: i32, y: i32) -> Self {
        Self { z, x, y }
    }
}

impl std::fmt::Display for Coord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "z:{} x:{} y:{}", self.z, self.x, self.y)
    }
}

/// 瓦片图像编码格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileFormat {
    Png,
    Jpeg,
}

impl TileFormat {
    /// 通过文件头识别格式
    pub fn detect(data: &[u8]) -> Option<TileFormat> {
        if data.len() >= 8 && data[0..4] == [0x89, 0x50, 0x4E, 0x47] {
            Some(TileFormat::Png)
        } else if data.len() >= 3 && data[0..3] == [0xFF, 0xD8, 0xFF] {
            Some(TileFormat::Jpeg)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Jpeg => "jpeg",
        }
    }
}

impl ToString for TileFormat {
    fn to_string(&self) -> String {
        match self {
            TileFormat::Png => "png".to_string(),
            TileFormat::Jpeg => "jpeg".to_string(),
        }
    }
}

impl From<&str> for TileFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "jpeg" | "jpg" => TileFormat::Jpeg,
            _ => TileFormat::Png,
        }
    }
}

/// 瓦片：一张带坐标的编码图像
///
/// 坐标允许在网格转换时重新绑定（set_coords），图像数据不重新编码。
#[derive(Debug, Clone)]
pub struct Tile {
    pub coord: Coord,
    pub format: TileFormat,
    data: Vec<u8>,
}

impl Tile {
    /// 创建瓦片，数据格式无法识别时返回错误
    pub fn new(coord: Coord, data: Vec<u8>) -> Result<Self, MergeError> {
        let format = TileFormat::detect(&data).ok_or_else(|| {
            MergeError::InvalidTile(format!("瓦片 {} 数据格式无法识别", coord))
        })?;
        Ok(Self { coord, format, data })
    }

    pub fn z(&self) -> i32 {
        self.coord.z
    }

    pub fn x(&self) -> i32 {
        self.coord.x
    }

    pub fn y(&self) -> i32 {
        self.coord.y
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 数据字节数
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 重新绑定坐标（网格/原点转换专用，不触碰图像数据）
    pub fn set_coords(&mut self, coord: Coord) {
        self.coord = coord;
    }
}

impl PartialEq for Tile {
    fn eq(&self, other: &Self) -> bool {
        self.coord == other.coord
    }
}

/// 地理范围（WGS84 度），由调用方保证 min <= max
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// 两个范围的并集
    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

/// 某一层级上的瓦片索引矩形，半开区间 [min, max)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileBounds {
    pub zoom: i32,
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

impl TileBounds {
    pub fn new(zoom: i32, min_x: i32, max_x: i32, min_y: i32, max_y: i32) -> Self {
        Self { zoom, min_x, max_x, min_y, max_y }
    }

    pub fn size(&self) -> i64 {
        (self.max_x - self.min_x) as i64 * (self.max_y - self.min_y) as i64
    }
}

/// 世界切片网格约定
///
/// TwoXOne: 0 级为 2 列 x 1 行（矩形世界，对应 360x180 度）
/// OneXOne: 0 级为 1x1（方形世界），其 z 级与 TwoXOne 的 z-1 级等价
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grid {
    #[serde(rename = "2x1")]
    TwoXOne,
    #[serde(rename = "1x1")]
    OneXOne,
}

impl ToString for Grid {
    fn to_string(&self) -> String {
        match self {
            Grid::TwoXOne => "2x1".to_string(),
            Grid::OneXOne => "1x1".to_string(),
        }
    }
}

impl From<&str> for Grid {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "1x1" => Grid::OneXOne,
            _ => Grid::TwoXOne,
        }
    }
}

/// 行号方向约定
///
/// LowerLeft: 第 0 行在最南（y 向北递增）
/// UpperLeft: 第 0 行在最北（y 向南递增）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridOrigin {
    #[serde(rename = "ll")]
    LowerLeft,
    #[serde(rename = "ul")]
    UpperLeft,
}

impl ToString for GridOrigin {
    fn to_string(&self) -> String {
        match self {
            GridOrigin::LowerLeft => "ll".to_string(),
            GridOrigin::UpperLeft => "ul".to_string(),
        }
    }
}

impl From<&str> for GridOrigin {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ul" | "upper_left" => GridOrigin::UpperLeft,
            _ => GridOrigin::LowerLeft,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        let png = [0x89u8, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(TileFormat::detect(&png), Some(TileFormat::Png));
        let jpeg = [0xFFu8, 0xD8, 0xFF, 0xE0];
        assert_eq!(TileFormat::detect(&jpeg), Some(TileFormat::Jpeg));
        assert_eq!(TileFormat::detect(&[0u8; 8]), None);
    }

    #[test]
    fn test_tile_rejects_unknown_format() {
        assert!(Tile::new(Coord::new(0, 0, 0), vec![0u8; 16]).is_err());
    }

    #[test]
    fn test_bounds_size() {
        let bounds = TileBounds::new(21, 0, 4194304, 0, 2097152);
        assert_eq!(bounds.size(), 4194304i64 * 2097152i64);
    }
}
