//! S3 后端（对象键布局与目录后端一致：{prefix}/{z}/{x}/{y}.png）
//!
//! 本地约定：左下角原点（TMS 键）。批次游标为上一批最后列出的对象键，
//! 依赖对象存储按键字典序列出的保证，续读用 list 的 offset 能力实现。
//! 凭证与区域取自环境变量（AWS_ACCESS_KEY_ID 等），端点可显式覆盖。

use crate::error::MergeError;
use crate::sources::{SourceOptions, TileBackend, TileBatch};
use crate::types::{Coord, Extent, Tile};
use futures::StreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use parking_lot::Mutex;
use tokio::runtime::Runtime;

pub struct S3Backend {
    store: AmazonS3,
    runtime: Runtime,
    prefix: String,
    label: String,
    batch_size: usize,
    max_batch_bytes: Option<u64>,
    cursor: Mutex<Option<String>>,
}

/// 对象键转瓦片坐标，取末尾的 z/x/y.ext 三段
fn parse_key(key: &str) -> Option<Coord> {
    let mut parts = key.rsplit('/');
    let file = parts.next()?;
    let y: i32 = file.split('.').next()?.parse().ok()?;
    let x: i32 = parts.next()?.parse().ok()?;
    let z: i32 = parts.next()?.parse().ok()?;
    Some(Coord::new(z, x, y))
}

fn tile_key(prefix: &str, z: i32, x: i32, y: i32, extension: &str) -> String {
    if prefix.is_empty() {
        format!("{}/{}/{}.{}", z, x, y, extension)
    } else {
        format!("{}/{}/{}/{}.{}", prefix, z, x, y, extension)
    }
}

impl S3Backend {
    pub fn new(options: &SourceOptions) -> Result<Self, MergeError> {
        // 路径形如 bucket/prefix...；桶名也可由 s3_bucket 单独给出
        let (bucket, prefix) = match &options.s3_bucket {
            Some(bucket) => (bucket.clone(), options.path.trim_matches('/').to_string()),
            None => {
                let trimmed = options.path.trim_matches('/');
                match trimmed.split_once('/') {
                    Some((bucket, prefix)) => (bucket.to_string(), prefix.to_string()),
                    None => (trimmed.to_string(), String::new()),
                }
            }
        };
        if bucket.is_empty() {
            return Err(MergeError::InvalidSource(
                "S3 源缺少桶名".to_string(),
            ));
        }

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&bucket);
        if let Some(endpoint) = &options.s3_endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        let store = builder.build()?;
        let runtime = Runtime::new()?;

        Ok(Self {
            store,
            runtime,
            label: format!("{}/{}", bucket, prefix),
            prefix,
            batch_size: options.batch_size,
            max_batch_bytes: options.max_batch_bytes,
            cursor: Mutex::new(None),
        })
    }

    fn list_prefix(&self) -> Option<ObjectPath> {
        if self.prefix.is_empty() {
            None
        } else {
            Some(ObjectPath::from(self.prefix.as_str()))
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, MergeError> {
        match self.store.get(&ObjectPath::from(key)).await {
            Ok(result) => Ok(Some(result.bytes().await?.to_vec())),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl TileBackend for S3Backend {
    /// 前缀下存在至少一个对象即视为存在；桶不可达按错误上抛
    fn exists(&self) -> Result<bool, MergeError> {
        self.runtime.block_on(async {
            let prefix = self.list_prefix();
            let mut stream = self.store.list(prefix.as_ref());
            match stream.next().await {
                Some(Ok(_)) => Ok(true),
                Some(Err(e)) => Err(e.into()),
                None => Ok(false),
            }
        })
    }

    fn tile_exists(&self, z: i32, x: i32, y: i32) -> Result<bool, MergeError> {
        self.runtime.block_on(async {
            for ext in ["png", "jpg", "jpeg"] {
                let key = tile_key(&self.prefix, z, x, y, ext);
                match self.store.head(&ObjectPath::from(key.as_str())).await {
                    Ok(_) => return Ok(true),
                    Err(object_store::Error::NotFound { .. }) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(false)
        })
    }

    fn get_tile(&self, z: i32, x: i32, y: i32) -> Result<Option<Tile>, MergeError> {
        self.runtime.block_on(async {
            for ext in ["png", "jpg", "jpeg"] {
                let key = tile_key(&self.prefix, z, x, y, ext);
                if let Some(data) = self.fetch(&key).await? {
                    return Ok(Some(Tile::new(Coord::new(z, x, y), data)?));
                }
            }
            Ok(None)
        })
    }

    fn get_next_batch(&self) -> Result<TileBatch, MergeError> {
        let mut cursor = self.cursor.lock();
        let start = cursor.clone();
        let (tiles, last_key) = self.runtime.block_on(async {
            let prefix = self.list_prefix();
            let mut stream = match &start {
                Some(offset) => self
                    .store
                    .list_with_offset(prefix.as_ref(), &ObjectPath::from(offset.as_str())),
                None => self.store.list(prefix.as_ref()),
            };

            let mut tiles = Vec::new();
            let mut last_key = None;
            let mut bytes: u64 = 0;
            while tiles.len() < self.batch_size {
                let meta = match stream.next().await {
                    Some(meta) => meta?,
                    None => break,
                };
                let key = meta.location.to_string();
                last_key = Some(key.clone());
                let coord = match parse_key(&key) {
                    Some(coord) => coord,
                    None => {
                        log::warn!("跳过布局外的对象 {}", key);
                        continue;
                    }
                };
                let data = match self.fetch(&key).await? {
                    Some(data) => data,
                    // 列出后又被删除，当作不存在
                    None => continue,
                };
                bytes += data.len() as u64;
                tiles.push(Tile::new(coord, data)?);
                if let Some(limit) = self.max_batch_bytes {
                    if bytes >= limit {
                        break;
                    }
                }
            }
            Ok::<_, MergeError>((tiles, last_key))
        })?;

        if let Some(key) = last_key {
            *cursor = Some(key);
        }
        Ok(TileBatch {
            tiles,
            cursor: start.unwrap_or_default(),
        })
    }

    /// 空串表示从头开始，其余为上一批结束处的对象键
    fn set_cursor(&self, cursor: &str) -> Result<(), MergeError> {
        *self.cursor.lock() = if cursor.is_empty() {
            None
        } else {
            Some(cursor.to_string())
        };
        Ok(())
    }

    fn update_tiles(&self, tiles: &[Tile]) -> Result<(), MergeError> {
        self.runtime.block_on(async {
            for tile in tiles {
                let key = tile_key(
                    &self.prefix,
                    tile.z(),
                    tile.x(),
                    tile.y(),
                    tile.format.extension(),
                );
                self.store
                    .put(&ObjectPath::from(key.as_str()), tile.data().to_vec().into())
                    .await?;
            }
            Ok(())
        })
    }

    fn tile_count(&self) -> Result<u64, MergeError> {
        self.runtime.block_on(async {
            let prefix = self.list_prefix();
            let mut stream = self.store.list(prefix.as_ref());
            let mut count = 0;
            while let Some(meta) = stream.next().await {
                meta?;
                count += 1;
            }
            Ok(count)
        })
    }

    fn reset(&self) {
        *self.cursor.lock() = None;
    }

    /// 对象存储没有需要预建的结构，base 创建是空操作
    fn create(&self, _extent: &Extent, _one_x_one: bool) -> Result<(), MergeError> {
        log::info!("S3 目标 {} 将在首次写入时产生对象", self.label);
        Ok(())
    }
}
