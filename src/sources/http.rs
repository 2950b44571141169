//! HTTP 模板后端（XYZ / TMS / WMTS），只读
//!
//! 本地行号约定由类型决定：XYZ 与 WMTS 为左上角原点，TMS 为左下角。
//! 远端不可枚举，批次按地理范围 + 层级区间生成的候选坐标顺序推进，
//! 游标为候选序列里的全局下标。404 视为瓦片不存在，其余失败状态码报错。

use crate::error::MergeError;
use crate::geo;
use crate::sources::{SourceOptions, TileBackend, TileBatch};
use crate::types::{Coord, GridOrigin, Tile, TileBounds};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::time::Duration;

/// URL 模板，编译时把 {x}/{y}/{z}（及 WMTS 的 {TileCol} 等别名）定位一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// 4 段固定文本，3 个变量按 slots 的顺序插在段与段之间
    segments: [String; 4],
    slots: [Axis; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
    Z,
}

impl UrlPattern {
    /// 模板必须恰好包含 x、y、z 三个占位符各一次
    pub fn compile(pattern: &str) -> Result<Self, MergeError> {
        let mut found: Vec<(usize, usize, Axis)> = Vec::new();
        for (name, axis) in [
            ("{x}", Axis::X),
            ("{X}", Axis::X),
            ("{TileCol}", Axis::X),
            ("{y}", Axis::Y),
            ("{Y}", Axis::Y),
            ("{TileRow}", Axis::Y),
            ("{z}", Axis::Z),
            ("{Z}", Axis::Z),
            ("{TileMatrix}", Axis::Z),
        ] {
            for (pos, _) in pattern.match_indices(name) {
                found.push((pos, name.len(), axis));
            }
        }
        if found.len() != 3 {
            return Err(MergeError::InvalidSource(format!(
                "URL 模板 {} 含 {} 个坐标占位符，需要恰好 x、y、z 各一个",
                pattern,
                found.len()
            )));
        }
        found.sort_by_key(|(pos, _, _)| *pos);
        let axes: Vec<Axis> = found.iter().map(|(_, _, axis)| *axis).collect();
        if !axes.contains(&Axis::X) || !axes.contains(&Axis::Y) || !axes.contains(&Axis::Z) {
            return Err(MergeError::InvalidSource(format!(
                "URL 模板 {} 的坐标占位符有重复",
                pattern
            )));
        }

        let mut segments: [String; 4] = Default::default();
        let mut slots = [Axis::X; 3];
        let mut last = 0;
        for (i, (pos, len, axis)) in found.into_iter().enumerate() {
            segments[i] = pattern[last..pos].to_string();
            slots[i] = axis;
            last = pos + len;
        }
        segments[3] = pattern[last..].to_string();
        Ok(Self { segments, slots })
    }

    pub fn render(&self, z: i32, x: i32, y: i32) -> String {
        let mut url = String::with_capacity(
            self.segments.iter().map(|s| s.len()).sum::<usize>() + 24,
        );
        for i in 0..3 {
            url.push_str(&self.segments[i]);
            let value = match self.slots[i] {
                Axis::X => x,
                Axis::Y => y,
                Axis::Z => z,
            };
            url.push_str(&value.to_string());
        }
        url.push_str(&self.segments[3]);
        url
    }
}

pub struct HttpBackend {
    pattern: UrlPattern,
    client: Client,
    /// 各层级的候选瓦片矩形（本地原点），批次按它的展开顺序推进
    ranges: Vec<TileBounds>,
    batch_size: usize,
    index: Mutex<i64>,
}

impl HttpBackend {
    pub fn new(options: &SourceOptions, origin: GridOrigin) -> Result<Self, MergeError> {
        let pattern = UrlPattern::compile(&options.path)?;
        let extent = options.extent.ok_or_else(|| {
            MergeError::InvalidSource(format!(
                "HTTP 源 {} 缺少地理范围，无法生成瓦片序列",
                options.path
            ))
        })?;
        if options.min_zoom > options.max_zoom {
            return Err(MergeError::InvalidSource(format!(
                "层级区间无效: {} > {}",
                options.min_zoom, options.max_zoom
            )));
        }
        let ranges = (options.min_zoom..=options.max_zoom)
            .map(|zoom| geo::extent_to_tile_range(extent, zoom, origin))
            .collect();
        let client = Client::builder()
            .timeout(Duration::from_secs(options.http_timeout_secs))
            .build()?;
        Ok(Self {
            pattern,
            client,
            ranges,
            batch_size: options.batch_size,
            index: Mutex::new(0),
        })
    }

    fn total_candidates(&self) -> i64 {
        self.ranges.iter().map(|r| r.size()).sum()
    }

    /// 全局下标转候选坐标，超出序列返回 None
    fn coord_at(&self, index: i64) -> Option<Coord> {
        let mut remaining = index;
        for range in &self.ranges {
            let size = range.size();
            if remaining < size {
                let width = (range.max_x - range.min_x) as i64;
                let row = remaining / width;
                let col = remaining % width;
                return Some(Coord::new(
                    range.zoom,
                    range.min_x + col as i32,
                    range.min_y + row as i32,
                ));
            }
            remaining -= size;
        }
        None
    }

    fn in_range(&self, z: i32, x: i32, y: i32) -> bool {
        self.ranges.iter().any(|r| {
            r.zoom == z && x >= r.min_x && x < r.max_x && y >= r.min_y && y < r.max_y
        })
    }

    fn fetch(&self, z: i32, x: i32, y: i32) -> Result<Option<Tile>, MergeError> {
        let url = self.pattern.render(z, x, y);
        let response = self.client.get(&url).send()?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let data = response.bytes()?.to_vec();
                Ok(Some(Tile::new(Coord::new(z, x, y), data)?))
            }
            status => Err(MergeError::InvalidSource(format!(
                "HTTP 源返回 {}: {}",
                status, url
            ))),
        }
    }
}

impl TileBackend for HttpBackend {
    /// 远端无法廉价探测，可达性在首次请求时暴露
    fn exists(&self) -> Result<bool, MergeError> {
        Ok(true)
    }

    fn tile_exists(&self, z: i32, x: i32, y: i32) -> Result<bool, MergeError> {
        Ok(self.get_tile(z, x, y)?.is_some())
    }

    fn get_tile(&self, z: i32, x: i32, y: i32) -> Result<Option<Tile>, MergeError> {
        if !self.in_range(z, x, y) {
            return Ok(None);
        }
        self.fetch(z, x, y)
    }

    fn get_next_batch(&self) -> Result<TileBatch, MergeError> {
        let mut index = self.index.lock();
        let start = *index;
        let total = self.total_candidates();
        let mut tiles = Vec::new();
        // 空洞（404）不计入批次大小，但推进游标
        while tiles.len() < self.batch_size && *index < total {
            if let Some(coord) = self.coord_at(*index) {
                if let Some(tile) = self.fetch(coord.z, coord.x, coord.y)? {
                    tiles.push(tile);
                }
            }
            *index += 1;
        }
        Ok(TileBatch {
            tiles,
            cursor: start.to_string(),
        })
    }

    fn set_cursor(&self, cursor: &str) -> Result<(), MergeError> {
        let index: i64 = cursor
            .parse()
            .map_err(|_| MergeError::InvalidCursor(cursor.to_string()))?;
        *self.index.lock() = index;
        Ok(())
    }

    fn update_tiles(&self, _tiles: &[Tile]) -> Result<(), MergeError> {
        Err(MergeError::SourceReadOnly(self.pattern.render(0, 0, 0)))
    }

    /// 候选总数是上界（空洞也计入），仅用于进度展示
    fn tile_count(&self) -> Result<u64, MergeError> {
        Ok(self.total_candidates() as u64)
    }

    fn reset(&self) {
        *self.index.lock() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;
    use crate::types::Extent;

    #[test]
    fn test_pattern_render_xyz() {
        let pattern = UrlPattern::compile("https://tile.example.com/{z}/{x}/{y}.png").unwrap();
        assert_eq!(
            pattern.render(3, 1, 2),
            "https://tile.example.com/3/1/2.png"
        );
    }

    #[test]
    fn test_pattern_render_wmts() {
        let pattern = UrlPattern::compile(
            "https://wmts.example.com/layer/{TileMatrix}/{TileRow}/{TileCol}.jpeg",
        )
        .unwrap();
        // WMTS 的行在列前
        assert_eq!(
            pattern.render(5, 10, 20),
            "https://wmts.example.com/layer/5/20/10.jpeg"
        );
    }

    #[test]
    fn test_pattern_rejects_bad_placeholders() {
        assert!(UrlPattern::compile("https://a/{z}/{x}.png").is_err());
        assert!(UrlPattern::compile("https://a/{z}/{x}/{x}.png").is_err());
        assert!(UrlPattern::compile("https://a/{z}/{x}/{y}/{y}.png").is_err());
        assert!(UrlPattern::compile("https://a/plain.png").is_err());
    }

    fn backend_for(extent: Extent, min_zoom: i32, max_zoom: i32) -> HttpBackend {
        let mut options = SourceOptions::new(
            SourceKind::Xyz,
            "https://tile.example.com/{z}/{x}/{y}.png",
            100,
        );
        options.extent = Some(extent);
        options.min_zoom = min_zoom;
        options.max_zoom = max_zoom;
        HttpBackend::new(&options, GridOrigin::UpperLeft).unwrap()
    }

    #[test]
    fn test_candidate_indexing() {
        // 全世界 0..=1 级：0 级 2x1，1 级 4x2
        let backend = backend_for(Extent::new(-180.0, -90.0, 180.0, 90.0), 0, 1);
        assert_eq!(backend.total_candidates(), 2 + 8);
        assert_eq!(backend.coord_at(0), Some(Coord::new(0, 0, 0)));
        assert_eq!(backend.coord_at(1), Some(Coord::new(0, 1, 0)));
        assert_eq!(backend.coord_at(2), Some(Coord::new(1, 0, 0)));
        assert_eq!(backend.coord_at(5), Some(Coord::new(1, 3, 0)));
        assert_eq!(backend.coord_at(6), Some(Coord::new(1, 0, 1)));
        assert_eq!(backend.coord_at(9), Some(Coord::new(1, 3, 1)));
        assert_eq!(backend.coord_at(10), None);
    }

    #[test]
    fn test_in_range() {
        let backend = backend_for(Extent::new(-180.0, -90.0, 180.0, 90.0), 1, 1);
        assert!(backend.in_range(1, 0, 0));
        assert!(backend.in_range(1, 3, 1));
        assert!(!backend.in_range(1, 4, 0));
        assert!(!backend.in_range(0, 0, 0));
        assert!(!backend.in_range(2, 0, 0));
    }

    #[test]
    fn test_missing_extent_rejected() {
        let options = SourceOptions::new(
            SourceKind::Xyz,
            "https://tile.example.com/{z}/{x}/{y}.png",
            100,
        );
        assert!(HttpBackend::new(&options, GridOrigin::UpperLeft).is_err());
    }

    #[test]
    fn test_read_only() {
        let backend = backend_for(Extent::new(-180.0, -90.0, 180.0, 90.0), 0, 0);
        assert!(matches!(
            backend.update_tiles(&[]),
            Err(MergeError::SourceReadOnly(_))
        ));
    }
}
