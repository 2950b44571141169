//! 瓦片合成
//!
//! 候选瓦片按优先级从低到高给出（惯例：目标已有瓦片在前，新源瓦片在后）。
//! 构建器是惰性的：从最高优先级往下取，遇到不透明瓦片即停，
//! 低优先级的源根本不会发起读取。

use crate::error::MergeError;
use crate::types::{Coord, Tile, TileFormat};
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;

/// 惰性候选瓦片构建器，返回 None 表示该源没有这块瓦片
pub type TileBuilder<'a> = Box<dyn Fn() -> Result<Option<Tile>, MergeError> + Send + Sync + 'a>;

/// 合并一个坐标上的候选瓦片栈
///
/// 所有候选都为空时返回 None（该坐标无需改动）；
/// 否则按 "over" 算子自底向上做 alpha 合成，
/// 结果统一重编码为 target_format 并绑定到 coord。
/// 候选数据损坏对该坐标是致命错误，不做静默跳过。
pub fn merge_tiles(
    builders: &[TileBuilder<'_>],
    coord: Coord,
    target_format: TileFormat,
) -> Result<Option<Tile>, MergeError> {
    // 从高优先级往低收集，直到拿到一张完全不透明的图
    let mut layers: Vec<DynamicImage> = Vec::new();
    for builder in builders.iter().rev() {
        let tile = match builder()? {
            Some(tile) => tile,
            None => continue,
        };
        if tile.z() > coord.z {
            return Err(MergeError::InvalidTile(format!(
                "瓦片 {} 层级高于目标 {}，不支持向下采样",
                tile.coord, coord
            )));
        }
        let image = image::load_from_memory(tile.data())?;
        let opaque = is_opaque(&image);
        layers.push(image);
        if opaque {
            break;
        }
    }

    // 栈底在 layers 末尾（最后收集的优先级最低）
    let mut canvas = match layers.pop() {
        Some(image) => image.to_rgba8(),
        None => return Ok(None),
    };
    while let Some(layer) = layers.pop() {
        image::imageops::overlay(&mut canvas, &layer.to_rgba8(), 0, 0);
    }

    let data = encode(canvas, target_format)?;
    Ok(Some(Tile::new(coord, data)?))
}

/// 没有 alpha 通道、或 alpha 全满的图走整张替换的捷径
fn is_opaque(image: &DynamicImage) -> bool {
    if !image.color().has_alpha() {
        return true;
    }
    match image {
        DynamicImage::ImageRgba8(buf) => buf.pixels().all(|p| p.0[3] == u8::MAX),
        DynamicImage::ImageLumaA8(buf) => buf.pixels().all(|p| p.0[1] == u8::MAX),
        _ => false,
    }
}

fn encode(canvas: RgbaImage, format: TileFormat) -> Result<Vec<u8>, MergeError> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        TileFormat::Png => {
            DynamicImage::ImageRgba8(canvas).write_to(&mut buf, ImageFormat::Png)?;
        }
        TileFormat::Jpeg => {
            // JPEG 不带 alpha，先压平到 RGB
            let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();
            DynamicImage::ImageRgb8(rgb).write_to(&mut buf, ImageFormat::Jpeg)?;
        }
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TILE_SIZE: u32 = 8;

    fn png_tile(coord: Coord, color: [u8; 4]) -> Tile {
        let img = RgbaImage::from_pixel(TILE_SIZE, TILE_SIZE, Rgba(color));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        Tile::new(coord, buf.into_inner()).unwrap()
    }

    /// 左半不透明蓝、右半全透明的覆盖层
    fn half_overlay(coord: Coord) -> Tile {
        let img = RgbaImage::from_fn(TILE_SIZE, TILE_SIZE, |x, _| {
            if x < TILE_SIZE / 2 {
                Rgba([0, 0, 255, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        Tile::new(coord, buf.into_inner()).unwrap()
    }

    fn builder_of(tile: Option<Tile>) -> TileBuilder<'static> {
        Box::new(move || Ok(tile.clone()))
    }

    #[test]
    fn test_merge_all_empty_returns_none() {
        let coord = Coord::new(3, 1, 2);
        let builders = vec![builder_of(None), builder_of(None)];
        let merged = merge_tiles(&builders, coord, TileFormat::Png).unwrap();
        assert!(merged.is_none());
    }

    #[test]
    fn test_merge_single_candidate_reencodes() {
        let coord = Coord::new(3, 1, 2);
        let tile = png_tile(coord, [200, 10, 10, 255]);
        let builders = vec![builder_of(None), builder_of(Some(tile))];
        let merged = merge_tiles(&builders, coord, TileFormat::Png)
            .unwrap()
            .unwrap();
        assert_eq!(merged.coord, coord);
        assert_eq!(merged.format, TileFormat::Png);
        let img = image::load_from_memory(merged.data()).unwrap().to_rgba8();
        assert_eq!(img.get_pixel(0, 0).0, [200, 10, 10, 255]);
    }

    #[test]
    fn test_merge_precedence() {
        let coord = Coord::new(5, 3, 4);
        let base = png_tile(coord, [255, 0, 0, 255]);
        let overlay = half_overlay(coord);
        let builders = vec![builder_of(Some(base)), builder_of(Some(overlay))];
        let merged = merge_tiles(&builders, coord, TileFormat::Png)
            .unwrap()
            .unwrap();
        let img = image::load_from_memory(merged.data()).unwrap().to_rgba8();
        // 覆盖层不透明处显示覆盖层，透明处露出底图
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert_eq!(img.get_pixel(TILE_SIZE - 1, 0).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_opaque_top_skips_lower_fetches() {
        let coord = Coord::new(5, 3, 4);
        let calls = AtomicUsize::new(0);
        let base: TileBuilder<'_> = Box::new(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(png_tile(coord, [255, 0, 0, 255])))
        });
        let top = builder_of(Some(png_tile(coord, [0, 255, 0, 255])));
        let builders = vec![base, top];
        let merged = merge_tiles(&builders, coord, TileFormat::Png)
            .unwrap()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let img = image::load_from_memory(merged.data()).unwrap().to_rgba8();
        assert_eq!(img.get_pixel(0, 0).0, [0, 255, 0, 255]);
    }

    #[test]
    fn test_corrupt_candidate_is_fatal() {
        let coord = Coord::new(2, 1, 1);
        // PNG 魔数合法但内容损坏，构造能过、解码必须报错
        let mut junk = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        junk.extend_from_slice(&[0u8; 16]);
        let corrupt = Tile::new(coord, junk).unwrap();
        let builders = vec![builder_of(Some(corrupt))];
        assert!(merge_tiles(&builders, coord, TileFormat::Png).is_err());
    }

    #[test]
    fn test_downscale_rejected() {
        let coord = Coord::new(2, 1, 1);
        let deeper = png_tile(Coord::new(4, 1, 1), [1, 2, 3, 255]);
        let builders = vec![builder_of(Some(deeper))];
        assert!(merge_tiles(&builders, coord, TileFormat::Png).is_err());
    }
}
