//! 可恢复的批次进度管理
//!
//! 按源路径记录每个批次游标的状态，连同启动命令一起序列化成 JSON。
//! 进程被打断后用状态文件重启，即可从最后一个未完成批次继续，
//! 已完成的工作不再重做（批次内为至少一次语义，写入是幂等覆盖）。

use crate::error::MergeError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// 单个批次的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    InProgress,
    Complete,
}

/// 单个源图层的进度
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerStatus {
    /// 最近一次下发的批次游标，恢复时用来重新定位后端
    pub batch_identifier: Option<String>,
    pub is_done: bool,
    pub total_completed_tiles: u64,
    pub batches: BTreeMap<String, BatchState>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BatchStatus {
    base_is_new: bool,
    command: Vec<String>,
    states: HashMap<String, LayerStatus>,
}

/// 批次状态管理器，本次合并运行内所有图层进度的唯一持有者
pub struct BatchStatusManager {
    inner: Mutex<BatchStatus>,
}

impl BatchStatusManager {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            inner: Mutex::new(BatchStatus {
                base_is_new: false,
                command,
                states: HashMap::new(),
            }),
        }
    }

    /// 创建图层记录，已存在时不动（幂等）
    pub fn initialize_layer(&self, layer: &str) {
        let mut inner = self.inner.lock();
        inner.states.entry(layer.to_string()).or_default();
    }

    /// 记录一个批次已下发（进行中），同时更新当前游标
    pub fn assign_batch(&self, layer: &str, cursor: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(layer) {
            state.batch_identifier = Some(cursor.to_string());
            state
                .batches
                .entry(cursor.to_string())
                .or_insert(BatchState::InProgress);
        }
    }

    /// 标记批次完成，重复调用是空操作
    pub fn complete_batch(&self, layer: &str, cursor: &str, total_completed_tiles: u64) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(layer) {
            state.total_completed_tiles = total_completed_tiles;
            state
                .batches
                .insert(cursor.to_string(), BatchState::Complete);
        }
    }

    pub fn is_batch_complete(&self, layer: &str, cursor: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .states
            .get(layer)
            .and_then(|state| state.batches.get(cursor))
            == Some(&BatchState::Complete)
    }

    /// 整层完成；所有未结清的批次随之视为已处理
    pub fn complete_layer(&self, layer: &str) {
        let mut inner = self.inner.lock();
        inner.base_is_new = false;
        if let Some(state) = inner.states.get_mut(layer) {
            state.is_done = true;
        }
    }

    pub fn is_layer_completed(&self, layer: &str) -> bool {
        let inner = self.inner.lock();
        inner.states.get(layer).map(|s| s.is_done).unwrap_or(false)
    }

    /// 恢复用游标：该层最近一次下发的批次，从未开始过的层返回 None
    pub fn get_layer_batch_identifier(&self, layer: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .states
            .get(layer)
            .and_then(|state| state.batch_identifier.clone())
    }

    /// 崩溃时仍处于进行中的批次，恢复后需要重放
    pub fn incomplete_batches(&self, layer: &str) -> Vec<String> {
        let inner = self.inner.lock();
        match inner.states.get(layer) {
            Some(state) => state
                .batches
                .iter()
                .filter(|(_, s)| **s == BatchState::InProgress)
                .map(|(c, _)| c.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get_total_completed_tiles(&self, layer: &str) -> u64 {
        let inner = self.inner.lock();
        inner
            .states
            .get(layer)
            .map(|s| s.total_completed_tiles)
            .unwrap_or(0)
    }

    /// 把所有已记录批次重新标记为进行中（需要整体重放时使用）
    pub fn reset_batch_status(&self) {
        let mut inner = self.inner.lock();
        for state in inner.states.values_mut() {
            for batch in state.batches.values_mut() {
                *batch = BatchState::InProgress;
            }
        }
    }

    pub fn set_base_is_new(&self, is_new: bool) {
        self.inner.lock().base_is_new = is_new;
    }

    pub fn is_base_new(&self) -> bool {
        self.inner.lock().base_is_new
    }

    /// 启动本次运行的原始命令行，恢复时据此重建数据源
    pub fn command(&self) -> Vec<String> {
        self.inner.lock().command.clone()
    }

    pub fn to_json(&self) -> Result<String, MergeError> {
        let inner = self.inner.lock();
        Ok(serde_json::to_string_pretty(&*inner)?)
    }

    pub fn from_json(json: &str) -> Result<Self, MergeError> {
        let status: BatchStatus = serde_json::from_str(json)?;
        Ok(Self {
            inner: Mutex::new(status),
        })
    }

    /// 写出快照文件（中断/异常时调用）
    pub fn save(&self, path: &Path) -> Result<(), MergeError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, MergeError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_round_trip() {
        let manager = BatchStatusManager::new(vec!["merge".into(), "1000".into()]);
        manager.initialize_layer("layer1");
        manager.assign_batch("layer1", "5");
        manager.complete_batch("layer1", "5", 1000);

        let json = manager.to_json().unwrap();
        let restored = BatchStatusManager::from_json(&json).unwrap();

        assert_eq!(
            restored.get_layer_batch_identifier("layer1"),
            Some("5".to_string())
        );
        assert!(restored.is_batch_complete("layer1", "5"));
        assert_eq!(restored.get_total_completed_tiles("layer1"), 1000);
        assert_eq!(restored.command(), vec!["merge", "1000"]);

        // 再次完成同一批次是空操作
        restored.complete_batch("layer1", "5", 1000);
        assert!(restored.is_batch_complete("layer1", "5"));
        assert!(restored.incomplete_batches("layer1").is_empty());
    }

    #[test]
    fn test_layer_completion_gate() {
        let manager = BatchStatusManager::new(vec![]);
        manager.initialize_layer("layer1");
        manager.assign_batch("layer1", "0");
        manager.complete_batch("layer1", "0", 10);
        // 所有批次完成也不等于整层完成
        assert!(!manager.is_layer_completed("layer1"));
        manager.complete_layer("layer1");
        assert!(manager.is_layer_completed("layer1"));
    }

    #[test]
    fn test_initialize_idempotent() {
        let manager = BatchStatusManager::new(vec![]);
        manager.initialize_layer("layer1");
        manager.assign_batch("layer1", "0");
        manager.initialize_layer("layer1");
        assert_eq!(
            manager.get_layer_batch_identifier("layer1"),
            Some("0".to_string())
        );
    }

    #[test]
    fn test_incomplete_batches_for_replay() {
        let manager = BatchStatusManager::new(vec![]);
        manager.initialize_layer("layer1");
        manager.assign_batch("layer1", "0");
        manager.assign_batch("layer1", "1000");
        manager.assign_batch("layer1", "2000");
        manager.complete_batch("layer1", "1000", 2000);

        let mut incomplete = manager.incomplete_batches("layer1");
        incomplete.sort();
        assert_eq!(incomplete, vec!["0".to_string(), "2000".to_string()]);
    }

    #[test]
    fn test_unknown_layer() {
        let manager = BatchStatusManager::new(vec![]);
        assert!(!manager.is_layer_completed("missing"));
        assert_eq!(manager.get_layer_batch_identifier("missing"), None);
        assert!(manager.incomplete_batches("missing").is_empty());
    }
}
