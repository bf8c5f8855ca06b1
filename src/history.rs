use crate::verdict::VerdictModel;
use std::collections::VecDeque;

/// 历史记录容量
pub const HISTORY_CAPACITY: usize = 10;

/// 模块：历史记录 (History Store)
///
/// 最新在前的有界日志，只追加、不去重、不重排，进程退出即丢失。
/// 超出容量时淘汰最旧的一条。
#[derive(Debug, Clone)]
pub struct HistoryStore {
    entries: VecDeque<VerdictModel>,
    capacity: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(HISTORY_CAPACITY + 1),
            capacity: HISTORY_CAPACITY,
        }
    }

    /// 头插；超出容量时丢掉尾部
    pub fn record(&mut self, verdict: VerdictModel) {
        self.entries.push_front(verdict);
        if self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    /// 快照，最新在前；返回的是拷贝，不暴露内部序列
    pub fn all(&self) -> Vec<VerdictModel> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
