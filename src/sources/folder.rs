//! 目录树后端，布局为 {root}/{z}/{x}/{y}.{png|jpg|jpeg}
//!
//! 本地约定：左下角原点。批次游标为已吐出的瓦片计数，
//! 枚举顺序靠逐目录排序保证确定性；若两次运行之间目录内容被改动，
//! 计数游标会指向不同的文件，这是该后端的已知弱点。

use crate::error::MergeError;
use crate::sources::{SourceOptions, TileBackend, TileBatch};
use crate::types::{Coord, Extent, Tile};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

const TILE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

pub struct FolderBackend {
    root: PathBuf,
    batch_size: usize,
    max_batch_bytes: Option<u64>,
    walk: Mutex<FolderWalk>,
}

/// 深度优先遍历状态，栈内路径逆序排放，弹出即为字典序
struct FolderWalk {
    stack: Vec<PathBuf>,
    emitted: u64,
    primed: bool,
}

impl FolderWalk {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            emitted: 0,
            primed: false,
        }
    }

    fn prime(&mut self, root: &Path) {
        self.stack.clear();
        self.stack.push(root.to_path_buf());
        self.emitted = 0;
        self.primed = true;
    }

    /// 下一个瓦片文件路径，目录读尽返回 None
    fn next_file(&mut self) -> Result<Option<PathBuf>, MergeError> {
        while let Some(path) = self.stack.pop() {
            if path.is_dir() {
                let mut children: Vec<PathBuf> = std::fs::read_dir(&path)?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .map(|entry| entry.path())
                    .collect();
                children.sort();
                children.reverse();
                self.stack.extend(children);
                continue;
            }
            let is_tile = path
                .extension()
                .map(|ext| {
                    let ext = ext.to_string_lossy().to_lowercase();
                    TILE_EXTENSIONS.contains(&ext.as_str())
                })
                .unwrap_or(false);
            if is_tile {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

impl FolderBackend {
    pub fn new(options: &SourceOptions) -> Result<Self, MergeError> {
        Ok(Self {
            root: PathBuf::from(&options.path),
            batch_size: options.batch_size,
            max_batch_bytes: options.max_batch_bytes,
            walk: Mutex::new(FolderWalk::new()),
        })
    }

    fn tile_path(&self, z: i32, x: i32, y: i32, extension: &str) -> PathBuf {
        self.root
            .join(z.to_string())
            .join(x.to_string())
            .join(format!("{}.{}", y, extension))
    }

    /// 从 {z}/{x}/{y}.ext 解析坐标，布局外的文件返回 None
    fn parse_coord(&self, path: &Path) -> Option<Coord> {
        let y: i32 = path.file_stem()?.to_str()?.parse().ok()?;
        let x_dir = path.parent()?;
        let x: i32 = x_dir.file_name()?.to_str()?.parse().ok()?;
        let z: i32 = x_dir.parent()?.file_name()?.to_str()?.parse().ok()?;
        Some(Coord::new(z, x, y))
    }

    fn read_tile(&self, path: &Path, coord: Coord) -> Result<Tile, MergeError> {
        let data = std::fs::read(path)?;
        Tile::new(coord, data)
    }
}

impl TileBackend for FolderBackend {
    fn exists(&self) -> Result<bool, MergeError> {
        Ok(self.root.is_dir())
    }

    fn tile_exists(&self, z: i32, x: i32, y: i32) -> Result<bool, MergeError> {
        Ok(TILE_EXTENSIONS
            .into_iter()
            .any(|ext| self.tile_path(z, x, y, ext).is_file()))
    }

    fn get_tile(&self, z: i32, x: i32, y: i32) -> Result<Option<Tile>, MergeError> {
        for ext in TILE_EXTENSIONS {
            let path = self.tile_path(z, x, y, ext);
            if path.is_file() {
                return Ok(Some(self.read_tile(&path, Coord::new(z, x, y))?));
            }
        }
        Ok(None)
    }

    fn get_next_batch(&self) -> Result<TileBatch, MergeError> {
        let mut walk = self.walk.lock();
        if !walk.primed {
            walk.prime(&self.root);
        }
        let start = walk.emitted;
        let mut tiles = Vec::new();
        let mut bytes: u64 = 0;
        while tiles.len() < self.batch_size {
            let path = match walk.next_file()? {
                Some(path) => path,
                None => break,
            };
            walk.emitted += 1;
            let coord = match self.parse_coord(&path) {
                Some(coord) => coord,
                None => {
                    log::warn!("跳过布局外的文件 {}", path.display());
                    continue;
                }
            };
            let tile = self.read_tile(&path, coord)?;
            bytes += tile.size() as u64;
            tiles.push(tile);
            if let Some(limit) = self.max_batch_bytes {
                if bytes >= limit {
                    break;
                }
            }
        }
        Ok(TileBatch {
            tiles,
            cursor: start.to_string(),
        })
    }

    /// 计数游标：从头重新遍历并跳过前 n 个瓦片文件
    fn set_cursor(&self, cursor: &str) -> Result<(), MergeError> {
        let skip: u64 = cursor
            .parse()
            .map_err(|_| MergeError::InvalidCursor(cursor.to_string()))?;
        let mut walk = self.walk.lock();
        walk.prime(&self.root);
        for _ in 0..skip {
            if walk.next_file()?.is_none() {
                break;
            }
            walk.emitted += 1;
        }
        Ok(())
    }

    fn update_tiles(&self, tiles: &[Tile]) -> Result<(), MergeError> {
        for tile in tiles {
            let path = self.tile_path(tile.z(), tile.x(), tile.y(), tile.format.extension());
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, tile.data())?;
            // 同坐标的旧格式文件一并清掉，保持坐标到文件一对一
            for ext in TILE_EXTENSIONS {
                if ext == tile.format.extension() {
                    continue;
                }
                let stale = self.tile_path(tile.z(), tile.x(), tile.y(), ext);
                if stale.is_file() {
                    std::fs::remove_file(stale)?;
                }
            }
        }
        Ok(())
    }

    fn tile_count(&self) -> Result<u64, MergeError> {
        let mut walk = FolderWalk::new();
        walk.prime(&self.root);
        let mut count = 0;
        while walk.next_file()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    fn reset(&self) {
        self.walk.lock().prime(&self.root);
    }

    fn create(&self, _extent: &Extent, _one_x_one: bool) -> Result<(), MergeError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
