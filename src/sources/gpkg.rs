//! GeoPackage 后端
//!
//! 本地约定：左上角原点。批次游标为瓦片表内的行偏移量，
//! 配合固定排序（zoom_level, tile_row, tile_column）实现精确续读。

use crate::error::MergeError;
use crate::geo;
use crate::sources::{SourceOptions, TileBackend, TileBatch};
use crate::types::{Coord, Extent, Tile};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;

pub struct GpkgBackend {
    path: PathBuf,
    batch_size: usize,
    max_batch_bytes: Option<u64>,
    vacuum: bool,
    max_zoom: i32,
    conn: Mutex<Option<Connection>>,
    table: Mutex<Option<String>>,
    one_x_one: Mutex<bool>,
    offset: Mutex<u64>,
}

impl GpkgBackend {
    pub fn new(options: &SourceOptions) -> Result<Self, MergeError> {
        Ok(Self {
            path: PathBuf::from(&options.path),
            batch_size: options.batch_size,
            max_batch_bytes: options.max_batch_bytes,
            vacuum: options.gpkg_vacuum,
            max_zoom: options.max_zoom,
            conn: Mutex::new(None),
            table: Mutex::new(None),
            one_x_one: Mutex::new(false),
            offset: Mutex::new(0),
        })
    }

    /// 懒打开连接；不存在的文件不会被悄悄创建（那是 create 的职责）
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, MergeError>,
    ) -> Result<T, MergeError> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
            *guard = Some(conn);
        }
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(MergeError::InvalidSource(format!(
                "无法打开 GPKG 文件 {}",
                self.path.display()
            ))),
        }
    }

    /// 瓦片表名来自 gpkg_contents，缓存一次
    fn table_name(&self, conn: &Connection) -> Result<String, MergeError> {
        let mut cached = self.table.lock();
        if let Some(name) = cached.as_ref() {
            return Ok(name.clone());
        }
        let name: Option<String> = conn
            .query_row(
                "SELECT table_name FROM gpkg_contents WHERE data_type = 'tiles' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let name = name.ok_or_else(|| {
            MergeError::InvalidSource(format!(
                "GPKG 文件 {} 中没有瓦片表",
                self.path.display()
            ))
        })?;
        *cached = Some(name.clone());
        Ok(name)
    }

    fn derived_table_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "tiles".to_string())
    }

    /// 重建 gpkg_tile_matrix，一行对应一个层级
    fn write_tile_matrix(
        conn: &Connection,
        table: &str,
        max_zoom: i32,
        one_x_one: bool,
    ) -> Result<(), MergeError> {
        for z in 0..=max_zoom {
            let width: i64 = if one_x_one { 1 << z } else { 2i64 << z };
            let height: i64 = 1 << z;
            let pixel = geo::degrees_per_tile(z) / 256.0;
            conn.execute(
                "INSERT OR REPLACE INTO gpkg_tile_matrix \
                 (table_name, zoom_level, matrix_width, matrix_height, \
                  tile_width, tile_height, pixel_x_size, pixel_y_size) \
                 VALUES (?1, ?2, ?3, ?4, 256, 256, ?5, ?5)",
                params![table, z, width, height, pixel],
            )?;
        }
        Ok(())
    }
}

impl TileBackend for GpkgBackend {
    fn exists(&self) -> Result<bool, MergeError> {
        Ok(self.path.is_file())
    }

    fn tile_exists(&self, z: i32, x: i32, y: i32) -> Result<bool, MergeError> {
        self.with_conn(|conn| {
            let table = self.table_name(conn)?;
            let found: Option<i64> = conn
                .query_row(
                    &format!(
                        "SELECT 1 FROM \"{}\" \
                         WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                        table
                    ),
                    params![z, x, y],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn get_tile(&self, z: i32, x: i32, y: i32) -> Result<Option<Tile>, MergeError> {
        self.with_conn(|conn| {
            let table = self.table_name(conn)?;
            let data: Option<Vec<u8>> = conn
                .query_row(
                    &format!(
                        "SELECT tile_data FROM \"{}\" \
                         WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                        table
                    ),
                    params![z, x, y],
                    |row| row.get(0),
                )
                .optional()?;
            match data {
                Some(data) => Ok(Some(Tile::new(Coord::new(z, x, y), data)?)),
                None => Ok(None),
            }
        })
    }

    fn get_next_batch(&self) -> Result<TileBatch, MergeError> {
        let mut offset = self.offset.lock();
        let start = *offset;
        let tiles = self.with_conn(|conn| {
            let table = self.table_name(conn)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT zoom_level, tile_column, tile_row, tile_data FROM \"{}\" \
                 ORDER BY zoom_level, tile_row, tile_column LIMIT ?1 OFFSET ?2",
                table
            ))?;
            let rows = stmt.query_map(params![self.batch_size as i64, start as i64], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, i32>(1)?,
                    row.get::<_, i32>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?;

            let mut tiles = Vec::new();
            let mut bytes: u64 = 0;
            for row in rows {
                let (z, x, y, data) = row?;
                bytes += data.len() as u64;
                tiles.push(Tile::new(Coord::new(z, x, y), data)?);
                // 字节上限至少放行一块瓦片，保证批次总能推进
                if let Some(limit) = self.max_batch_bytes {
                    if bytes >= limit {
                        break;
                    }
                }
            }
            Ok(tiles)
        })?;
        *offset = start + tiles.len() as u64;
        Ok(TileBatch {
            tiles,
            cursor: start.to_string(),
        })
    }

    fn set_cursor(&self, cursor: &str) -> Result<(), MergeError> {
        let offset: u64 = cursor
            .parse()
            .map_err(|_| MergeError::InvalidCursor(cursor.to_string()))?;
        *self.offset.lock() = offset;
        Ok(())
    }

    fn update_tiles(&self, tiles: &[Tile]) -> Result<(), MergeError> {
        self.with_conn(|conn| {
            let table = self.table_name(conn)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT OR REPLACE INTO \"{}\" \
                     (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
                    table
                ))?;
                for tile in tiles {
                    stmt.execute(params![tile.z(), tile.x(), tile.y(), tile.data()])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn tile_count(&self) -> Result<u64, MergeError> {
        self.with_conn(|conn| {
            let table = self.table_name(conn)?;
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
                    row.get(0)
                })?;
            Ok(count as u64)
        })
    }

    fn reset(&self) {
        *self.offset.lock() = 0;
    }

    /// 收尾：按实际数据重建层级矩阵，可选 VACUUM 回收空间
    fn wrapup(&self) -> Result<(), MergeError> {
        let one_x_one = *self.one_x_one.lock();
        self.with_conn(|conn| {
            let table = self.table_name(conn)?;
            Self::write_tile_matrix(conn, &table, self.max_zoom, one_x_one)?;
            Ok(())
        })?;
        if self.vacuum {
            log::info!("对 GPKG 目标 {} 执行 VACUUM", self.path.display());
            self.with_conn(|conn| {
                conn.execute_batch("VACUUM")?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn create(&self, extent: &Extent, one_x_one: bool) -> Result<(), MergeError> {
        let table = self.derived_table_name();
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA application_id = 0x47504B47;
             PRAGMA user_version = 10200;
             CREATE TABLE gpkg_spatial_ref_sys (
                 srs_name TEXT NOT NULL,
                 srs_id INTEGER PRIMARY KEY,
                 organization TEXT NOT NULL,
                 organization_coordsys_id INTEGER NOT NULL,
                 definition TEXT NOT NULL,
                 description TEXT
             );
             CREATE TABLE gpkg_contents (
                 table_name TEXT PRIMARY KEY,
                 data_type TEXT NOT NULL,
                 identifier TEXT UNIQUE,
                 description TEXT DEFAULT '',
                 last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                 min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE,
                 srs_id INTEGER,
                 CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id)
                     REFERENCES gpkg_spatial_ref_sys(srs_id)
             );
             CREATE TABLE gpkg_tile_matrix_set (
                 table_name TEXT PRIMARY KEY,
                 srs_id INTEGER NOT NULL,
                 min_x DOUBLE NOT NULL, min_y DOUBLE NOT NULL,
                 max_x DOUBLE NOT NULL, max_y DOUBLE NOT NULL
             );
             CREATE TABLE gpkg_tile_matrix (
                 table_name TEXT NOT NULL,
                 zoom_level INTEGER NOT NULL,
                 matrix_width INTEGER NOT NULL,
                 matrix_height INTEGER NOT NULL,
                 tile_width INTEGER NOT NULL,
                 tile_height INTEGER NOT NULL,
                 pixel_x_size DOUBLE NOT NULL,
                 pixel_y_size DOUBLE NOT NULL,
                 CONSTRAINT pk_ttm PRIMARY KEY (table_name, zoom_level)
             );",
        )?;
        conn.execute(
            "INSERT INTO gpkg_spatial_ref_sys \
             (srs_name, srs_id, organization, organization_coordsys_id, definition) VALUES \
             ('WGS 84', 4326, 'EPSG', 4326, 'GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",\
              SPHEROID[\"WGS 84\",6378137,298.257223563]],PRIMEM[\"Greenwich\",0],\
              UNIT[\"degree\",0.0174532925199433]]')",
            [],
        )?;
        conn.execute_batch(&format!(
            "CREATE TABLE \"{t}\" (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 zoom_level INTEGER NOT NULL,
                 tile_column INTEGER NOT NULL,
                 tile_row INTEGER NOT NULL,
                 tile_data BLOB NOT NULL
             );
             CREATE UNIQUE INDEX \"{t}_tile_index\" ON \"{t}\" (zoom_level, tile_column, tile_row);",
            t = table
        ))?;
        conn.execute(
            "INSERT INTO gpkg_contents \
             (table_name, data_type, identifier, last_change, min_x, min_y, max_x, max_y, srs_id) \
             VALUES (?1, 'tiles', ?1, ?2, ?3, ?4, ?5, ?6, 4326)",
            params![
                table,
                Utc::now().to_rfc3339(),
                extent.min_x,
                extent.min_y,
                extent.max_x,
                extent.max_y
            ],
        )?;
        // 矩阵集范围是网格的全世界范围，不随数据范围收缩
        let world = geo::default_extent(one_x_one);
        conn.execute(
            "INSERT INTO gpkg_tile_matrix_set (table_name, srs_id, min_x, min_y, max_x, max_y) \
             VALUES (?1, 4326, ?2, ?3, ?4, ?5)",
            params![table, world.min_x, world.min_y, world.max_x, world.max_y],
        )?;
        Self::write_tile_matrix(&conn, &table, self.max_zoom, one_x_one)?;

        *self.table.lock() = Some(table);
        *self.one_x_one.lock() = one_x_one;
        *self.conn.lock() = Some(conn);
        Ok(())
    }

    /// 用 0 级矩阵行校验网格布局，避免把 1x1 包当 2x1 合并
    fn validate_grid(&self, one_x_one: bool) -> Result<(), MergeError> {
        *self.one_x_one.lock() = one_x_one;
        self.with_conn(|conn| {
            let table = self.table_name(conn)?;
            let row: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT matrix_width, matrix_height FROM gpkg_tile_matrix \
                     WHERE table_name = ?1 AND zoom_level = 0",
                    params![table],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let expected = if one_x_one { (1, 1) } else { (2, 1) };
            match row {
                Some(actual) if actual != expected => Err(MergeError::InvalidSource(format!(
                    "GPKG {} 的 0 级矩阵为 {}x{}，与期望网格 {}x{} 不符",
                    self.path.display(),
                    actual.0,
                    actual.1,
                    expected.0,
                    expected.1
                ))),
                _ => Ok(()),
            }
        })
    }

    fn stored_extent(&self) -> Result<Option<Extent>, MergeError> {
        self.with_conn(|conn| {
            let table = self.table_name(conn)?;
            let extent: Option<(f64, f64, f64, f64)> = conn
                .query_row(
                    "SELECT min_x, min_y, max_x, max_y FROM gpkg_contents WHERE table_name = ?1",
                    params![table],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                        ))
                    },
                )
                .optional()?;
            Ok(extent.map(|(min_x, min_y, max_x, max_y)| Extent::new(min_x, min_y, max_x, max_y)))
        })
    }

    fn update_extent(&self, extent: &Extent) -> Result<(), MergeError> {
        self.with_conn(|conn| {
            let table = self.table_name(conn)?;
            conn.execute(
                "UPDATE gpkg_contents SET min_x = ?2, min_y = ?3, max_x = ?4, max_y = ?5, \
                 last_change = ?6 WHERE table_name = ?1",
                params![
                    table,
                    extent.min_x,
                    extent.min_y,
                    extent.max_x,
                    extent.max_y,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }
}
