//! 地理范围与瓦片索引互转（EPSG:4326，2x1 网格）

use crate::types::{Extent, GridOrigin, TileBounds};

/// 指定层级上单个瓦片的跨度（度）
pub fn degrees_per_tile(zoom: i32) -> f64 {
    180.0 / (1i64 << zoom) as f64
}

/// 把范围各边向外吸附到瓦片边界，结果恰好覆盖整数个瓦片
///
/// 0 级只有一行，Y 方向固定吸附到 [-90, 90]。
pub fn snap_extent_to_tile_grid(extent: Extent, zoom: i32) -> Extent {
    let tile = degrees_per_tile(zoom);
    let min_x = ((extent.min_x + 180.0) / tile).floor() * tile - 180.0;
    let max_x = ((extent.max_x + 180.0) / tile).ceil() * tile - 180.0;
    let (min_y, max_y) = if zoom == 0 {
        (-90.0, 90.0)
    } else {
        (
            ((extent.min_y + 90.0) / tile).floor() * tile - 90.0,
            ((extent.max_y + 90.0) / tile).ceil() * tile - 90.0,
        )
    };
    Extent::new(min_x, min_y, max_x, max_y)
}

/// 地理范围转瓦片索引矩形（先吸附，再按目标原点翻转 Y 区间）
pub fn extent_to_tile_range(extent: Extent, zoom: i32, origin: GridOrigin) -> TileBounds {
    let snapped = snap_extent_to_tile_grid(extent, zoom);
    let tile = degrees_per_tile(zoom);

    // 吸附后必为整数，round 只是抹掉浮点误差
    let min_x = ((snapped.min_x + 180.0) / tile).round() as i32;
    let max_x = ((snapped.max_x + 180.0) / tile).round() as i32;
    let mut min_y = ((snapped.min_y + 90.0) / tile).round() as i32;
    let mut max_y = ((snapped.max_y + 90.0) / tile).round() as i32;

    if origin == GridOrigin::UpperLeft {
        let rows = 1 << zoom;
        let flipped = rows - max_y;
        max_y = rows - min_y;
        min_y = flipped;
    }

    TileBounds::new(zoom, min_x, max_x, min_y, max_y)
}

/// 瓦片索引矩形转回地理范围，仅支持左下原点（调用方先归一化）
pub fn tile_range_to_extent(bounds: &TileBounds) -> Extent {
    let tile = degrees_per_tile(bounds.zoom);
    Extent::new(
        bounds.min_x as f64 * tile - 180.0,
        bounds.min_y as f64 * tile - 90.0,
        bounds.max_x as f64 * tile - 180.0,
        bounds.max_y as f64 * tile - 90.0,
    )
}

/// 数据源未记录范围时使用的全世界范围
pub fn default_extent(is_one_x_one: bool) -> Extent {
    if is_one_x_one {
        Extent::new(-180.0, -180.0, 180.0, 180.0)
    } else {
        Extent::new(-180.0, -90.0, 180.0, 90.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrees_per_tile() {
        assert_eq!(degrees_per_tile(0), 180.0);
        assert_eq!(degrees_per_tile(19), 0.00034332275390625);
    }

    #[test]
    fn test_snap_full_world_is_noop() {
        let world = Extent::new(-180.0, -90.0, 180.0, 90.0);
        assert_eq!(snap_extent_to_tile_grid(world, 21), world);
    }

    #[test]
    fn test_snap_zoom_zero_pins_y() {
        let extent = Extent::new(95.6471142, 12.42158146886, 99.1275474144, 12.42159);
        let snapped = snap_extent_to_tile_grid(extent, 0);
        assert_eq!(snapped, Extent::new(0.0, -90.0, 180.0, 90.0));
    }

    #[test]
    fn test_snap_rounds_outward() {
        let extent = Extent::new(84.37469412158, 21.093768421484, 106.0, 88.46985612);
        let snapped = snap_extent_to_tile_grid(extent, 7);
        assert_eq!(snapped, Extent::new(82.96875, 21.09375, 106.875, 88.59375));
    }

    #[test]
    fn test_full_world_range() {
        let world = Extent::new(-180.0, -90.0, 180.0, 90.0);
        let range = extent_to_tile_range(world, 21, GridOrigin::LowerLeft);
        assert_eq!(range, TileBounds::new(21, 0, 4194304, 0, 2097152));
        // 全世界范围翻转前后一致
        let range = extent_to_tile_range(world, 21, GridOrigin::UpperLeft);
        assert_eq!(range, TileBounds::new(21, 0, 4194304, 0, 2097152));
    }

    #[test]
    fn test_range_origin_flip() {
        let extent = Extent::new(84.37469412158, 21.093768421484, 106.0, 88.59375);
        let ll = extent_to_tile_range(extent, 7, GridOrigin::LowerLeft);
        assert_eq!(ll, TileBounds::new(7, 187, 204, 79, 127));
        let ul = extent_to_tile_range(extent, 7, GridOrigin::UpperLeft);
        assert_eq!(ul, TileBounds::new(7, 187, 204, 1, 49));
    }

    #[test]
    fn test_single_tile_range() {
        let extent = Extent::new(0.0, 0.0, 0.175781, 0.175781);
        let ll = extent_to_tile_range(extent, 10, GridOrigin::LowerLeft);
        assert_eq!(ll, TileBounds::new(10, 1024, 1025, 512, 513));
        let ul = extent_to_tile_range(extent, 10, GridOrigin::UpperLeft);
        assert_eq!(ul, TileBounds::new(10, 1024, 1025, 511, 512));
    }

    #[test]
    fn test_range_extent_inverse() {
        let extent = Extent::new(84.3, 21.0, 106.1, 88.5);
        let range = extent_to_tile_range(extent, 9, GridOrigin::LowerLeft);
        let back = tile_range_to_extent(&range);
        // 还原的是吸附后的范围，不是原始范围
        assert_eq!(back, snap_extent_to_tile_grid(extent, 9));
        assert_eq!(extent_to_tile_range(back, 9, GridOrigin::LowerLeft), range);
    }
}
