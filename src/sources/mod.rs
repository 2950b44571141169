//! 瓦片数据源
//!
//! 每种后端只负责以自己的本地网格/原点存取瓦片，坐标转换全部发生在
//! TileSource 适配层：引擎内部统一为 2x1 网格 + 左下角原点，
//! 进出后端时按需翻转原点、换算 1x1 网格。合并核心只面对 TileSource，
//! 从不区分后端种类。

mod folder;
mod gpkg;
mod http;
mod s3;

pub use folder::FolderBackend;
pub use gpkg::GpkgBackend;
pub use http::HttpBackend;
pub use s3::S3Backend;

use crate::error::MergeError;
use crate::geo;
use crate::grid;
use crate::types::{Coord, Extent, Grid, GridOrigin, Tile};
use serde::{Deserialize, Serialize};

/// 数据源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Gpkg,
    Folder,
    S3,
    Xyz,
    Tms,
    Wmts,
}

impl SourceKind {
    /// 后端的本地行号原点约定
    pub fn default_origin(&self) -> GridOrigin {
        match self {
            SourceKind::Gpkg | SourceKind::Xyz | SourceKind::Wmts => GridOrigin::UpperLeft,
            SourceKind::Folder | SourceKind::S3 | SourceKind::Tms => GridOrigin::LowerLeft,
        }
    }

    /// HTTP 模板类数据源只读
    pub fn is_http(&self) -> bool {
        matches!(self, SourceKind::Xyz | SourceKind::Tms | SourceKind::Wmts)
    }
}

impl ToString for SourceKind {
    fn to_string(&self) -> String {
        match self {
            SourceKind::Gpkg => "gpkg".to_string(),
            SourceKind::Folder => "fs".to_string(),
            SourceKind::S3 => "s3".to_string(),
            SourceKind::Xyz => "xyz".to_string(),
            SourceKind::Tms => "tms".to_string(),
            SourceKind::Wmts => "wmts".to_string(),
        }
    }
}

impl From<&str> for SourceKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "gpkg" => SourceKind::Gpkg,
            "s3" => SourceKind::S3,
            "xyz" => SourceKind::Xyz,
            "tms" => SourceKind::Tms,
            "wmts" => SourceKind::Wmts,
            _ => SourceKind::Folder,
        }
    }
}

/// 一批瓦片及标识该批次的游标（游标指向批次起点）
#[derive(Debug)]
pub struct TileBatch {
    pub tiles: Vec<Tile>,
    pub cursor: String,
}

/// 后端能力接口
///
/// 所有坐标都是后端本地网格/原点下的值，转换不是后端的职责。
/// 批次契约：空批次表示读尽，读尽后重复调用仍返回空；
/// 用之前发出的游标 set_cursor 可以精确续读（目录枚举顺序的稳定性
/// 是已知弱点，见 folder 模块说明）。
pub trait TileBackend: Send + Sync {
    /// 被寻址的资源（文件/目录/桶/表）是否存在
    fn exists(&self) -> Result<bool, MergeError>;

    fn tile_exists(&self, z: i32, x: i32, y: i32) -> Result<bool, MergeError>;

    /// 点查，不存在返回 None（正常情形，不是错误）
    fn get_tile(&self, z: i32, x: i32, y: i32) -> Result<Option<Tile>, MergeError>;

    fn get_next_batch(&self) -> Result<TileBatch, MergeError>;

    fn set_cursor(&self, cursor: &str) -> Result<(), MergeError>;

    /// 按坐标幂等覆盖写入
    fn update_tiles(&self, tiles: &[Tile]) -> Result<(), MergeError>;

    fn tile_count(&self) -> Result<u64, MergeError>;

    fn reset(&self);

    /// 收尾（刷索引等），多数后端为空操作
    fn wrapup(&self) -> Result<(), MergeError> {
        Ok(())
    }

    /// 新建 base 目标，仅可写后端支持
    fn create(&self, _extent: &Extent, _one_x_one: bool) -> Result<(), MergeError> {
        Err(MergeError::InvalidSource(
            "该数据源不支持创建 base 目标".to_string(),
        ))
    }

    /// 校验已有目标的网格布局，默认不校验
    fn validate_grid(&self, _one_x_one: bool) -> Result<(), MergeError> {
        Ok(())
    }

    /// 后端自带的地理范围（gpkg_contents 等），没有则 None
    fn stored_extent(&self) -> Result<Option<Extent>, MergeError> {
        Ok(None)
    }

    /// 更新后端记录的地理范围
    fn update_extent(&self, _extent: &Extent) -> Result<(), MergeError> {
        Ok(())
    }
}

/// 数据源构建参数
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub kind: SourceKind,
    pub path: String,
    pub batch_size: usize,
    pub grid: Option<Grid>,
    pub origin: Option<GridOrigin>,
    pub is_base: bool,
    pub extent: Option<Extent>,
    pub min_zoom: i32,
    pub max_zoom: i32,
    pub max_batch_bytes: Option<u64>,
    pub gpkg_vacuum: bool,
    pub http_timeout_secs: u64,
    pub s3_endpoint: Option<String>,
    pub s3_bucket: Option<String>,
}

impl SourceOptions {
    pub fn new(kind: SourceKind, path: &str, batch_size: usize) -> Self {
        Self {
            kind,
            path: path.to_string(),
            batch_size,
            grid: None,
            origin: None,
            is_base: false,
            extent: None,
            min_zoom: 0,
            max_zoom: 21,
            max_batch_bytes: None,
            gpkg_vacuum: false,
            http_timeout_secs: 30,
            s3_endpoint: None,
            s3_bucket: None,
        }
    }
}

/// 按类型标签构建数据源，合并核心此后不再关心后端种类
pub fn create_source(options: SourceOptions) -> Result<TileSource, MergeError> {
    let origin = options.origin.unwrap_or_else(|| options.kind.default_origin());
    let backend: Box<dyn TileBackend> = match options.kind {
        SourceKind::Gpkg => Box::new(GpkgBackend::new(&options)?),
        SourceKind::Folder => Box::new(FolderBackend::new(&options)?),
        SourceKind::S3 => Box::new(S3Backend::new(&options)?),
        SourceKind::Xyz | SourceKind::Tms | SourceKind::Wmts => {
            Box::new(HttpBackend::new(&options, origin)?)
        }
    };
    TileSource::new(backend, options, origin)
}

/// 数据源适配层：坐标换算 + 瓦片解析
pub struct TileSource {
    pub kind: SourceKind,
    pub path: String,
    pub grid: Grid,
    pub origin: GridOrigin,
    pub is_base: bool,
    pub is_new: bool,
    pub extent: Extent,
    backend: Box<dyn TileBackend>,
}

impl TileSource {
    pub fn new(
        backend: Box<dyn TileBackend>,
        options: SourceOptions,
        origin: GridOrigin,
    ) -> Result<Self, MergeError> {
        let grid = options.grid.unwrap_or(Grid::TwoXOne);
        let one_x_one = grid == Grid::OneXOne;

        log::info!(
            "检查数据源是否存在, {}: {}",
            options.kind.to_string(),
            options.path
        );
        let mut is_new = false;
        if !backend.exists()? {
            if options.is_base {
                let extent = options
                    .extent
                    .ok_or_else(|| {
                        MergeError::InvalidSource(format!(
                            "base 目标 {} 不存在且未提供范围，无法创建",
                            options.path
                        ))
                    })?;
                log::info!("base 目标 {} 不存在，创建新目标", options.path);
                backend.create(&extent, one_x_one)?;
                is_new = true;
            } else {
                return Err(MergeError::InvalidSource(format!(
                    "{} 源 {} 不存在",
                    options.kind.to_string(),
                    options.path
                )));
            }
        }
        backend.validate_grid(one_x_one)?;

        let extent = match options.extent {
            Some(extent) => extent,
            None => backend
                .stored_extent()?
                .unwrap_or_else(|| geo::default_extent(one_x_one)),
        };
        if options.is_base {
            backend.update_extent(&extent)?;
        }

        Ok(Self {
            kind: options.kind,
            path: options.path,
            grid,
            origin,
            is_base: options.is_base,
            is_new,
            extent,
            backend,
        })
    }

    pub fn is_one_x_one(&self) -> bool {
        self.grid == Grid::OneXOne
    }

    /// 引擎坐标转后端本地坐标：先翻原点，再换网格。
    /// 网格在该层级不可表示时返回 None（当作瓦片不存在）。
    fn native_coord(&self, coord: Coord) -> Option<Coord> {
        let mut coord = coord;
        if self.origin == GridOrigin::UpperLeft {
            coord.y = grid::flip_y(coord.z, coord.y);
        }
        if self.is_one_x_one() {
            grid::try_coord_from_two_x_one(coord)
        } else {
            Some(coord)
        }
    }

    /// 后端吐出的瓦片换回引擎约定
    fn tile_to_engine(&self, mut tile: Tile) -> Option<Tile> {
        if self.origin == GridOrigin::UpperLeft {
            tile = grid::flip_tile_y(tile);
        }
        if self.is_one_x_one() {
            grid::try_tile_to_two_x_one(tile)
        } else {
            Some(tile)
        }
    }

    fn tile_to_native(&self, mut tile: Tile) -> Option<Tile> {
        if self.origin == GridOrigin::UpperLeft {
            tile = grid::flip_tile_y(tile);
        }
        if self.is_one_x_one() {
            grid::try_tile_from_two_x_one(tile)
        } else {
            Some(tile)
        }
    }

    /// 同层点查；命中时把瓦片重新挂回请求坐标
    pub fn get_tile(&self, coord: Coord) -> Result<Option<Tile>, MergeError> {
        let native = match self.native_coord(coord) {
            Some(native) => native,
            None => return Ok(None),
        };
        let tile = self.backend.get_tile(native.z, native.x, native.y)?;
        Ok(tile.map(|mut tile| {
            tile.set_coords(coord);
            tile
        }))
    }

    pub fn tile_exists(&self, coord: Coord) -> Result<bool, MergeError> {
        match self.native_coord(coord) {
            Some(native) => self.backend.tile_exists(native.z, native.x, native.y),
            None => Ok(false),
        }
    }

    /// 祖先回退：沿 z-1..0 对本地坐标整除 2 逐层点查，取第一个命中。
    /// 命中的瓦片保留祖先自身的坐标（它是低清晰度替身，不做重采样）。
    fn last_existing_tile(&self, coord: Coord) -> Result<Option<Tile>, MergeError> {
        let native = match self.native_coord(coord) {
            Some(native) => native,
            None => return Ok(None),
        };
        let mut x = native.x;
        let mut y = native.y;
        for z in (0..native.z).rev() {
            x >>= 1;
            y >>= 1;
            if let Some(mut tile) = self.backend.get_tile(z, x, y)? {
                if self.is_one_x_one() {
                    // 1x1 低层级换不回 2x1，视为整个金字塔无可用祖先
                    match grid::try_to_two_x_one(tile.z(), tile.x(), tile.y()) {
                        Some(converted) => tile.set_coords(converted),
                        None => return Ok(None),
                    }
                }
                return Ok(Some(tile));
            }
        }
        Ok(None)
    }

    /// 解析坐标对应的瓦片；upscale 时允许回退到低层级祖先
    pub fn get_corresponding_tile(
        &self,
        coord: Coord,
        upscale: bool,
    ) -> Result<Option<Tile>, MergeError> {
        let tile = self.get_tile(coord)?;
        if tile.is_none() && upscale {
            let fallback = self.last_existing_tile(coord)?;
            if let Some(ref tile) = fallback {
                log::debug!("坐标 {} 回退到祖先瓦片 {}", coord, tile.coord);
            }
            return Ok(fallback);
        }
        Ok(tile)
    }

    /// 取下一批瓦片并换算到引擎约定；换不过去的（1x1 低层级）直接丢弃
    pub fn get_next_batch(&self) -> Result<TileBatch, MergeError> {
        let batch = self.backend.get_next_batch()?;
        let tiles = batch
            .tiles
            .into_iter()
            .filter_map(|tile| self.tile_to_engine(tile))
            .collect();
        Ok(TileBatch {
            tiles,
            cursor: batch.cursor,
        })
    }

    pub fn set_cursor(&self, cursor: &str) -> Result<(), MergeError> {
        self.backend.set_cursor(cursor)
    }

    /// 幂等写入：重复坐标覆盖而不是追加
    pub fn update_tiles(&self, tiles: Vec<Tile>) -> Result<(), MergeError> {
        let converted: Vec<Tile> = tiles
            .into_iter()
            .filter_map(|tile| self.tile_to_native(tile))
            .collect();
        if converted.is_empty() {
            return Ok(());
        }
        self.backend.update_tiles(&converted)
    }

    pub fn tile_count(&self) -> Result<u64, MergeError> {
        self.backend.tile_count()
    }

    pub fn reset(&self) {
        self.backend.reset();
    }

    pub fn wrapup(&self) -> Result<(), MergeError> {
        self.backend.wrapup()
    }

    /// base 目标吸收新源的元数据（目前只有范围并集）
    pub fn update_metadata(&mut self, other: &TileSource) -> Result<(), MergeError> {
        if !self.is_base {
            return Ok(());
        }
        let union = self.extent.union(&other.extent);
        self.backend.update_extent(&union)?;
        self.extent = union;
        Ok(())
    }
}
