//! 命令行入口
//!
//! 用法：
//!   tile-merger <批次大小> <目标定义> <源定义> [<源定义>...]
//!   tile-merger <状态文件>          从中断处恢复
//!
//! 源定义：
//!   gpkg|fs|s3 <路径> [--1x1] [--UL|--LL]
//!   xyz|tms|wmts <URL模板> <bbox> <最小层级> <最大层级> [--1x1] [--UL|--LL]
//!
//! 第一个源是合并目标（必须可写），其余源按给出顺序依次合入，
//! 排在后面的优先级更高。中断或出错时进度写入 status.json。

use std::path::Path;
use std::sync::Arc;
use tile_merger::config::CONFIG;
use tile_merger::geo;
use tile_merger::process::Process;
use tile_merger::sources::{create_source, SourceKind, SourceOptions};
use tile_merger::status::BatchStatusManager;
use tile_merger::types::{Extent, Grid, GridOrigin};
use tile_merger::MergeError;

const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone)]
struct SourceSpec {
    kind: SourceKind,
    path: String,
    grid: Option<Grid>,
    origin: Option<GridOrigin>,
    extent: Option<Extent>,
    min_zoom: i32,
    max_zoom: i32,
}

fn parse_kind(token: &str) -> Result<SourceKind, MergeError> {
    match token.to_lowercase().as_str() {
        "gpkg" => Ok(SourceKind::Gpkg),
        "fs" | "folder" => Ok(SourceKind::Folder),
        "s3" => Ok(SourceKind::S3),
        "xyz" => Ok(SourceKind::Xyz),
        "tms" => Ok(SourceKind::Tms),
        "wmts" => Ok(SourceKind::Wmts),
        other => Err(MergeError::InvalidSource(format!(
            "未知的数据源类型 '{}'",
            other
        ))),
    }
}

/// bbox 格式：minX,minY,maxX,maxY（度）
fn parse_extent(token: &str) -> Result<Extent, MergeError> {
    let parts: Vec<f64> = token
        .split(',')
        .map(|p| p.trim().parse())
        .collect::<Result<_, _>>()
        .map_err(|_| MergeError::InvalidSource(format!("bbox 格式无效 '{}'", token)))?;
    if parts.len() != 4 || parts[0] > parts[2] || parts[1] > parts[3] {
        return Err(MergeError::InvalidSource(format!(
            "bbox 格式无效 '{}'",
            token
        )));
    }
    Ok(Extent::new(parts[0], parts[1], parts[2], parts[3]))
}

fn parse_zoom(token: &str) -> Result<i32, MergeError> {
    token
        .parse()
        .map_err(|_| MergeError::InvalidSource(format!("层级无效 '{}'", token)))
}

fn parse_args(args: &[String]) -> Result<(usize, Vec<SourceSpec>), MergeError> {
    let mut iter = args.iter().peekable();
    let batch_size: usize = iter
        .next()
        .ok_or_else(|| MergeError::InvalidSource("缺少批次大小".to_string()))?
        .parse()
        .map_err(|_| MergeError::InvalidSource("批次大小必须是正整数".to_string()))?;
    if batch_size == 0 {
        return Err(MergeError::InvalidSource(
            "批次大小必须是正整数".to_string(),
        ));
    }

    let mut specs = Vec::new();
    while let Some(token) = iter.next() {
        let kind = parse_kind(token)?;
        let path = iter
            .next()
            .ok_or_else(|| {
                MergeError::InvalidSource(format!("{} 源缺少路径", kind.to_string()))
            })?
            .clone();
        let mut spec = SourceSpec {
            kind,
            path,
            grid: None,
            origin: None,
            extent: None,
            min_zoom: 0,
            max_zoom: 21,
        };
        if kind.is_http() {
            let bbox = iter.next().ok_or_else(|| {
                MergeError::InvalidSource(format!("{} 源缺少 bbox", kind.to_string()))
            })?;
            spec.extent = Some(parse_extent(bbox)?);
            spec.min_zoom = parse_zoom(iter.next().ok_or_else(|| {
                MergeError::InvalidSource(format!("{} 源缺少最小层级", kind.to_string()))
            })?)?;
            spec.max_zoom = parse_zoom(iter.next().ok_or_else(|| {
                MergeError::InvalidSource(format!("{} 源缺少最大层级", kind.to_string()))
            })?)?;
        }
        while let Some(flag) = iter.peek() {
            match flag.as_str() {
                "--1x1" => {
                    spec.grid = Some(Grid::OneXOne);
                    iter.next();
                }
                "--UL" | "--ul" => {
                    spec.origin = Some(GridOrigin::UpperLeft);
                    iter.next();
                }
                "--LL" | "--ll" => {
                    spec.origin = Some(GridOrigin::LowerLeft);
                    iter.next();
                }
                _ => break,
            }
        }
        specs.push(spec);
    }

    if specs.len() < 2 {
        return Err(MergeError::InvalidSource(
            "至少需要一个目标和一个源".to_string(),
        ));
    }
    if specs[0].kind.is_http() {
        return Err(MergeError::InvalidSource(
            "HTTP 源为只读，不能作为合并目标".to_string(),
        ));
    }
    Ok((batch_size, specs))
}

fn build_options(spec: &SourceSpec, batch_size: usize, is_base: bool) -> SourceOptions {
    let mut options = SourceOptions::new(spec.kind, &spec.path, batch_size);
    options.grid = spec.grid;
    options.origin = spec.origin;
    options.is_base = is_base;
    options.min_zoom = spec.min_zoom;
    options.max_zoom = spec.max_zoom;
    options.max_batch_bytes = CONFIG.max_batch_bytes;
    options.gpkg_vacuum = CONFIG.gpkg_vacuum;
    options.http_timeout_secs = CONFIG.http_timeout_secs;
    options.s3_endpoint = CONFIG.s3_endpoint.clone();
    options.extent = spec.extent;
    if is_base && options.extent.is_none() {
        // 新建目标时用网格的全世界范围，后续按合入的源做并集收窄记录
        let one_x_one = spec.grid == Some(Grid::OneXOne);
        options.extent = Some(geo::default_extent(one_x_one));
    }
    options
}

fn run(
    manager: &BatchStatusManager,
    batch_size: usize,
    specs: Vec<SourceSpec>,
) -> Result<(), MergeError> {
    let mut base = create_source(build_options(&specs[0], batch_size, true))?;
    if base.is_new {
        manager.set_base_is_new(true);
    }

    let process = Process::new(CONFIG.worker_count, CONFIG.target_format, manager);
    for spec in &specs[1..] {
        let source = create_source(build_options(spec, batch_size, false))?;
        process.start(&mut base, &source)?;
        if CONFIG.validate && !process.validate(&base, &source)? {
            return Err(MergeError::InvalidSource(format!(
                "图层 {} 合并结果校验失败",
                source.path
            )));
        }
    }
    base.wrapup()?;
    Ok(())
}

fn print_usage() {
    eprintln!("用法:");
    eprintln!("  tile-merger <批次大小> <目标> <源> [<源>...]");
    eprintln!("  tile-merger <状态文件>");
    eprintln!();
    eprintln!("源定义:");
    eprintln!("  gpkg|fs|s3 <路径> [--1x1] [--UL|--LL]");
    eprintln!("  xyz|tms|wmts <URL模板> <minX,minY,maxX,maxY> <最小层级> <最大层级> [--1x1] [--UL|--LL]");
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (manager, command) = if args.len() == 1 {
        // 单参数视为状态文件，按其中记录的原始命令恢复
        match BatchStatusManager::load(Path::new(&args[0])) {
            Ok(manager) => {
                log::info!("从状态文件 {} 恢复合并", args[0]);
                if manager.is_base_new() {
                    // 目标是上次运行新建的，写入可能不完整，所有批次重放
                    log::warn!("目标在上次运行中新建，重放全部已记录批次");
                    manager.reset_batch_status();
                }
                let command = manager.command();
                (Arc::new(manager), command)
            }
            Err(e) => {
                log::error!("读取状态文件 {} 失败: {}", args[0], e);
                std::process::exit(2);
            }
        }
    } else {
        (
            Arc::new(BatchStatusManager::new(args.clone())),
            args.clone(),
        )
    };

    let (batch_size, specs) = match parse_args(&command) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::error!("参数错误: {}", e);
            print_usage();
            std::process::exit(2);
        }
    };

    let handler_manager = Arc::clone(&manager);
    let handler = ctrlc::set_handler(move || {
        log::warn!("收到中断信号，保存进度到 {}", STATUS_FILE);
        if let Err(e) = handler_manager.save(Path::new(STATUS_FILE)) {
            log::error!("保存状态文件失败: {}", e);
        }
        std::process::exit(130);
    });
    if let Err(e) = handler {
        log::warn!("注册中断处理器失败: {}", e);
    }

    match run(&manager, batch_size, specs) {
        Ok(()) => {
            // 成功结束后状态文件不再有意义
            let _ = std::fs::remove_file(STATUS_FILE);
            log::info!("全部图层合并完成");
        }
        Err(e) => {
            log::error!("合并失败: {}", e);
            if let Err(e) = manager.save(Path::new(STATUS_FILE)) {
                log::error!("保存状态文件失败: {}", e);
            } else {
                log::info!("进度已保存到 {}，可用它恢复运行", STATUS_FILE);
            }
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_file_sources() {
        let (batch_size, specs) =
            parse_args(&args(&["1000", "gpkg", "target.gpkg", "fs", "./tiles", "--1x1"])).unwrap();
        assert_eq!(batch_size, 1000);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].kind, SourceKind::Gpkg);
        assert_eq!(specs[0].grid, None);
        assert_eq!(specs[1].kind, SourceKind::Folder);
        assert_eq!(specs[1].grid, Some(Grid::OneXOne));
    }

    #[test]
    fn test_parse_http_source() {
        let (_, specs) = parse_args(&args(&[
            "500",
            "gpkg",
            "target.gpkg",
            "xyz",
            "https://a/{z}/{x}/{y}.png",
            "-10,-10,10,10",
            "3",
            "12",
        ]))
        .unwrap();
        assert_eq!(specs[1].kind, SourceKind::Xyz);
        assert_eq!(specs[1].extent, Some(Extent::new(-10.0, -10.0, 10.0, 10.0)));
        assert_eq!(specs[1].min_zoom, 3);
        assert_eq!(specs[1].max_zoom, 12);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        // 目标不能是 HTTP 源
        assert!(parse_args(&args(&[
            "100",
            "xyz",
            "https://a/{z}/{x}/{y}.png",
            "-10,-10,10,10",
            "0",
            "5",
            "fs",
            "./tiles"
        ]))
        .is_err());
        // 至少两个源
        assert!(parse_args(&args(&["100", "gpkg", "only.gpkg"])).is_err());
        // 批次大小必须为正
        assert!(parse_args(&args(&["0", "gpkg", "a.gpkg", "fs", "./b"])).is_err());
        assert!(parse_args(&args(&["abc", "gpkg", "a.gpkg", "fs", "./b"])).is_err());
        // 未知类型
        assert!(parse_args(&args(&["100", "mbtiles", "a", "fs", "./b"])).is_err());
    }

    #[test]
    fn test_parse_extent_validation() {
        assert!(parse_extent("0,0,10").is_err());
        assert!(parse_extent("10,0,0,10").is_err());
        assert!(parse_extent("a,b,c,d").is_err());
        assert_eq!(
            parse_extent(" -180, -90, 180, 90 ").unwrap(),
            Extent::new(-180.0, -90.0, 180.0, 90.0)
        );
    }
}
