//! 合并流程编排
//!
//! 一次 start 把一个新源整层合入 base 目标：先串行重放上次运行
//! 遗留的进行中批次，再由工作线程池消费后续批次。
//! 取批次 + 登记批次在同一个临界区内完成，保证状态文件里
//! 记录的游标与实际下发的批次一一对应。

use crate::error::MergeError;
use crate::merge::{merge_tiles, TileBuilder};
use crate::sources::TileSource;
use crate::status::BatchStatusManager;
use crate::types::{Tile, TileFormat};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct Process<'a> {
    worker_count: usize,
    target_format: TileFormat,
    status: &'a BatchStatusManager,
}

impl<'a> Process<'a> {
    pub fn new(
        worker_count: usize,
        target_format: TileFormat,
        status: &'a BatchStatusManager,
    ) -> Self {
        Self {
            worker_count: worker_count.max(1),
            target_format,
            status,
        }
    }

    /// 把 new_source 合入 base；可重入，已完成的层和批次直接跳过
    pub fn start(&self, base: &mut TileSource, new_source: &TileSource) -> Result<(), MergeError> {
        let layer = new_source.path.clone();
        self.status.initialize_layer(&layer);
        if self.status.is_layer_completed(&layer) {
            log::info!("图层 {} 已在之前的运行中合并完成，跳过", layer);
            return Ok(());
        }

        base.update_metadata(new_source)?;

        let total_tiles = new_source.tile_count()?;
        log::info!("开始合并图层 {}，约 {} 块瓦片", layer, total_tiles);

        let completed = AtomicU64::new(self.status.get_total_completed_tiles(&layer));

        // 阶段一：串行重放崩溃时仍在进行中的批次
        for cursor in self.status.incomplete_batches(&layer) {
            log::info!("重放未完成批次，图层 {} 游标 {}", layer, cursor);
            new_source.set_cursor(&cursor)?;
            let batch = new_source.get_next_batch()?;
            let merged = Self::merge_batch(base, &batch.tiles, self.target_format)?;
            let total = completed.fetch_add(merged, Ordering::Relaxed) + merged;
            self.status.complete_batch(&layer, &cursor, total);
        }

        // 阶段二：回到最后下发的位置继续；该批次若已完成会被跳过（至少一次语义）
        if let Some(cursor) = self.status.get_layer_batch_identifier(&layer) {
            new_source.set_cursor(&cursor)?;
        }

        let dispatch = Mutex::new(());
        let stop = AtomicBool::new(false);
        let failure: Mutex<Option<MergeError>> = Mutex::new(None);
        let base_ref: &TileSource = base;

        std::thread::scope(|scope| {
            for _ in 0..self.worker_count {
                scope.spawn(|| loop {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    // 取批次与登记游标必须原子，否则恢复时游标会错位
                    let batch = {
                        let _guard = dispatch.lock();
                        match new_source.get_next_batch() {
                            Ok(batch) => {
                                if !batch.tiles.is_empty() {
                                    self.status.assign_batch(&layer, &batch.cursor);
                                }
                                batch
                            }
                            Err(e) => {
                                Self::record_failure(&failure, &stop, e);
                                break;
                            }
                        }
                    };
                    if batch.tiles.is_empty() {
                        break;
                    }
                    if self.status.is_batch_complete(&layer, &batch.cursor) {
                        continue;
                    }
                    match Self::merge_batch(base_ref, &batch.tiles, self.target_format) {
                        Ok(merged) => {
                            let total = completed.fetch_add(merged, Ordering::Relaxed) + merged;
                            self.status.complete_batch(&layer, &batch.cursor, total);
                            log::info!("图层 {} 进度 {}/{}", layer, total, total_tiles);
                        }
                        Err(e) => {
                            Self::record_failure(&failure, &stop, e);
                            break;
                        }
                    }
                });
            }
        });

        if let Some(e) = failure.into_inner() {
            return Err(e);
        }
        self.status.complete_layer(&layer);
        log::info!(
            "图层 {} 合并完成，共 {} 块瓦片",
            layer,
            completed.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// 合并一个批次并写回目标，返回写入的瓦片数
    fn merge_batch(
        base: &TileSource,
        tiles: &[Tile],
        target_format: TileFormat,
    ) -> Result<u64, MergeError> {
        let mut merged = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let coord = tile.coord;
            let incoming = tile.clone();
            let builders: Vec<TileBuilder<'_>> = vec![
                Box::new(move || base.get_corresponding_tile(coord, true)),
                Box::new(move || Ok(Some(incoming.clone()))),
            ];
            if let Some(result) = merge_tiles(&builders, coord, target_format)? {
                merged.push(result);
            }
        }
        let count = merged.len() as u64;
        base.update_tiles(merged)?;
        Ok(count)
    }

    fn record_failure(failure: &Mutex<Option<MergeError>>, stop: &AtomicBool, e: MergeError) {
        log::error!("合并批次失败: {}", e);
        let mut guard = failure.lock();
        if guard.is_none() {
            *guard = Some(e);
        }
        stop.store(true, Ordering::Relaxed);
    }

    /// 校验：新源的每块瓦片在目标里都有对应瓦片（含祖先回退）
    pub fn validate(
        &self,
        base: &TileSource,
        new_source: &TileSource,
    ) -> Result<bool, MergeError> {
        new_source.reset();
        let mut checked: u64 = 0;
        let mut missing: u64 = 0;
        loop {
            let batch = new_source.get_next_batch()?;
            if batch.tiles.is_empty() {
                break;
            }
            for tile in &batch.tiles {
                checked += 1;
                if base.get_corresponding_tile(tile.coord, true)?.is_none() {
                    missing += 1;
                    log::error!("目标缺少瓦片 {}", tile.coord);
                }
            }
        }
        if missing > 0 {
            log::error!("校验失败: 检查 {} 块，缺少 {} 块", checked, missing);
            Ok(false)
        } else {
            log::info!("校验通过: 共检查 {} 块瓦片", checked);
            Ok(true)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{create_source, SourceKind, SourceOptions};
    use crate::types::{Coord, Extent};
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor as IoCursor;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tile_merger_test_proc_{}_{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    fn png_tile(coord: Coord, color: [u8; 4]) -> Tile {
        let img = RgbaImage::from_pixel(8, 8, Rgba(color));
        let mut buf = IoCursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        Tile::new(coord, buf.into_inner()).unwrap()
    }

    fn folder_source(path: &PathBuf, is_base: bool, batch_size: usize) -> TileSource {
        let mut options =
            SourceOptions::new(SourceKind::Folder, path.to_str().unwrap(), batch_size);
        options.is_base = is_base;
        if is_base {
            options.extent = Some(Extent::new(-180.0, -90.0, 180.0, 90.0));
        }
        create_source(options).unwrap()
    }

    #[test]
    fn test_merge_two_folders() {
        let base_dir = temp_dir("base");
        let new_dir = temp_dir("new");
        std::fs::create_dir_all(&new_dir).unwrap();

        let new_source = folder_source(&new_dir, false, 2);
        new_source
            .update_tiles(vec![
                png_tile(Coord::new(2, 0, 0), [255, 0, 0, 255]),
                png_tile(Coord::new(2, 1, 0), [0, 255, 0, 255]),
                png_tile(Coord::new(2, 2, 1), [0, 0, 255, 255]),
            ])
            .unwrap();

        let mut base = folder_source(&base_dir, true, 2);
        assert!(base.is_new);
        let status = BatchStatusManager::new(vec!["test".into()]);
        let process = Process::new(2, TileFormat::Png, &status);
        process.start(&mut base, &new_source).unwrap();

        // 三块瓦片都应落入目标
        for coord in [Coord::new(2, 0, 0), Coord::new(2, 1, 0), Coord::new(2, 2, 1)] {
            assert!(base.tile_exists(coord).unwrap(), "缺少 {}", coord);
        }
        assert!(status.is_layer_completed(new_dir.to_str().unwrap()));
        assert_eq!(
            status.get_total_completed_tiles(new_dir.to_str().unwrap()),
            3
        );
        assert!(process.validate(&base, &new_source).unwrap());

        let _ = std::fs::remove_dir_all(&base_dir);
        let _ = std::fs::remove_dir_all(&new_dir);
    }

    #[test]
    fn test_base_tile_survives_transparent_overlay() {
        let base_dir = temp_dir("overlay_base");
        let new_dir = temp_dir("overlay_new");
        std::fs::create_dir_all(&new_dir).unwrap();

        let coord = Coord::new(3, 1, 2);
        let new_source = folder_source(&new_dir, false, 10);
        // 全透明的新瓦片不应抹掉目标里已有的内容
        new_source
            .update_tiles(vec![png_tile(coord, [0, 0, 0, 0])])
            .unwrap();

        let mut base = folder_source(&base_dir, true, 10);
        base.update_tiles(vec![png_tile(coord, [200, 100, 50, 255])])
            .unwrap();

        let status = BatchStatusManager::new(vec![]);
        let process = Process::new(1, TileFormat::Png, &status);
        process.start(&mut base, &new_source).unwrap();

        let merged = base.get_tile(coord).unwrap().unwrap();
        let img = image::load_from_memory(merged.data()).unwrap().to_rgba8();
        assert_eq!(img.get_pixel(0, 0).0, [200, 100, 50, 255]);

        let _ = std::fs::remove_dir_all(&base_dir);
        let _ = std::fs::remove_dir_all(&new_dir);
    }

    #[test]
    fn test_resume_skips_completed_layer() {
        let base_dir = temp_dir("resume_base");
        let new_dir = temp_dir("resume_new");
        std::fs::create_dir_all(&new_dir).unwrap();

        let new_source = folder_source(&new_dir, false, 10);
        new_source
            .update_tiles(vec![png_tile(Coord::new(1, 0, 0), [9, 9, 9, 255])])
            .unwrap();

        let mut base = folder_source(&base_dir, true, 10);
        let status = BatchStatusManager::new(vec![]);
        let layer = new_dir.to_str().unwrap();
        status.initialize_layer(layer);
        status.complete_layer(layer);

        let process = Process::new(1, TileFormat::Png, &status);
        process.start(&mut base, &new_source).unwrap();
        // 整层已完成，目标不应被写入
        assert!(!base.tile_exists(Coord::new(1, 0, 0)).unwrap());

        let _ = std::fs::remove_dir_all(&base_dir);
        let _ = std::fs::remove_dir_all(&new_dir);
    }

    #[test]
    fn test_resume_replays_in_progress_batch() {
        let base_dir = temp_dir("replay_base");
        let new_dir = temp_dir("replay_new");
        std::fs::create_dir_all(&new_dir).unwrap();

        let new_source = folder_source(&new_dir, false, 2);
        new_source
            .update_tiles(vec![
                png_tile(Coord::new(2, 0, 0), [1, 1, 1, 255]),
                png_tile(Coord::new(2, 1, 0), [2, 2, 2, 255]),
                png_tile(Coord::new(2, 2, 0), [3, 3, 3, 255]),
            ])
            .unwrap();

        // 模拟上次运行：第一批（游标 0）下发后崩溃
        let status = BatchStatusManager::new(vec![]);
        let layer = new_dir.to_str().unwrap();
        status.initialize_layer(layer);
        status.assign_batch(layer, "0");
        let json = status.to_json().unwrap();

        let restored = BatchStatusManager::from_json(&json).unwrap();
        let mut base = folder_source(&base_dir, true, 2);
        let process = Process::new(1, TileFormat::Png, &restored);
        process.start(&mut base, &new_source).unwrap();

        for coord in [Coord::new(2, 0, 0), Coord::new(2, 1, 0), Coord::new(2, 2, 0)] {
            assert!(base.tile_exists(coord).unwrap(), "缺少 {}", coord);
        }
        assert!(restored.is_layer_completed(layer));

        let _ = std::fs::remove_dir_all(&base_dir);
        let _ = std::fs::remove_dir_all(&new_dir);
    }
}
