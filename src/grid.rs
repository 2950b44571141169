//! 1x1 与 2x1 网格互转
//!
//! 两种约定只在最低层级以上等价：方形网格表示不了矩形网格的 0 级，
//! 反之亦然，所以 try_* 版本在层级不足时返回 None（常规情形，非错误）。

use crate::types::{Coord, Tile};

/// 2x1 坐标转 1x1 坐标，要求 z >= 1
pub fn from_two_x_one(z: i32, x: i32, y: i32) -> Coord {
    Coord::new(z + 1, x, y + (1 << (z - 1)))
}

/// 2x1 坐标转 1x1 坐标，z < 1 时返回 None
pub fn try_from_two_x_one(z: i32, x: i32, y: i32) -> Option<Coord> {
    if z < 1 {
        return None;
    }
    Some(from_two_x_one(z, x, y))
}

pub fn try_coord_from_two_x_one(coord: Coord) -> Option<Coord> {
    try_from_two_x_one(coord.z, coord.x, coord.y)
}

/// 1x1 坐标转 2x1 坐标，要求 z >= 2
pub fn to_two_x_one(z: i32, x: i32, y: i32) -> Coord {
    let z = z - 1;
    Coord::new(z, x, y - (1 << (z - 1)))
}

/// 1x1 坐标转 2x1 坐标，z < 2 时返回 None
pub fn try_to_two_x_one(z: i32, x: i32, y: i32) -> Option<Coord> {
    if z < 2 {
        return None;
    }
    Some(to_two_x_one(z, x, y))
}

/// 瓦片版本：坐标重新绑定，图像数据不动
pub fn try_tile_from_two_x_one(mut tile: Tile) -> Option<Tile> {
    let coord = try_from_two_x_one(tile.z(), tile.x(), tile.y())?;
    tile.set_coords(coord);
    Some(tile)
}

pub fn try_tile_to_two_x_one(mut tile: Tile) -> Option<Tile> {
    let coord = try_to_two_x_one(tile.z(), tile.x(), tile.y())?;
    tile.set_coords(coord);
    Some(tile)
}

/// 上/下原点互换：y' = 2^z - y - 1，自反
pub fn flip_y(z: i32, y: i32) -> i32 {
    (1 << z) - y - 1
}

pub fn flip_tile_y(mut tile: Tile) -> Tile {
    let coord = Coord::new(tile.z(), tile.x(), flip_y(tile.z(), tile.y()));
    tile.set_coords(coord);
    tile
}
