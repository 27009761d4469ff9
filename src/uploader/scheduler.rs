// 优先级调度器
//
// 维护等待队列并按策略排序：
// - 优先级提示高的在前
// - fifo：到达顺序；smallest_first：大小升序；largest_first：大小降序
// - 其余相同时按到达顺序
//
// next(n) 选中的文件在同一次调用中被标记为 Active（原子交接）

use crate::config::PriorityMode;
use crate::uploader::task::{FileId, FileStatus, QueuedFile, UploadRecord};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// 共享文件记录
pub type SharedRecord = Arc<Mutex<UploadRecord>>;

#[derive(Debug)]
struct PendingEntry {
    id: FileId,
    size: u64,
    priority: i32,
    seq: u64,
    record: SharedRecord,
}

/// 排序键比较：(优先级, 大小, 到达序号)
fn compare_keys(mode: PriorityMode, a: (i32, u64, u64), b: (i32, u64, u64)) -> Ordering {
    let by_mode = match mode {
        PriorityMode::Fifo => Ordering::Equal,
        PriorityMode::SmallestFirst => a.1.cmp(&b.1),
        PriorityMode::LargestFirst => b.1.cmp(&a.1),
    };
    b.0.cmp(&a.0).then(by_mode).then(a.2.cmp(&b.2))
}

fn rank(mode: PriorityMode, a: &PendingEntry, b: &PendingEntry) -> Ordering {
    compare_keys(mode, (a.priority, a.size, a.seq), (b.priority, b.size, b.seq))
}

/// 按调度策略比较两个文件（Less 表示 a 排在前面）
pub fn rank_files(mode: PriorityMode, a: &QueuedFile, b: &QueuedFile) -> Ordering {
    compare_keys(mode, (a.priority, a.size, a.seq), (b.priority, b.size, b.seq))
}

/// 优先级调度器
#[derive(Debug)]
pub struct PriorityScheduler {
    mode: PriorityMode,
    /// 始终按 rank 有序
    pending: Vec<PendingEntry>,
}

impl PriorityScheduler {
    pub fn new(mode: PriorityMode) -> Self {
        Self {
            mode,
            pending: Vec::new(),
        }
    }

    pub fn mode(&self) -> PriorityMode {
        self.mode
    }

    /// 加入等待队列（重新入队的文件保留原到达序号）
    pub fn enqueue(&mut self, record: SharedRecord) -> FileId {
        let entry = {
            let mut r = record.lock();
            r.file.status = FileStatus::Queued;
            PendingEntry {
                id: r.file.id.clone(),
                size: r.file.size,
                priority: r.file.priority,
                seq: r.file.seq,
                record: record.clone(),
            }
        };
        let id = entry.id.clone();

        // 同一文件不重复入队
        self.pending.retain(|e| e.id != id);
        let mode = self.mode;
        let pos = self
            .pending
            .partition_point(|e| rank(mode, e, &entry) != Ordering::Greater);
        self.pending.insert(pos, entry);

        debug!("文件加入等待队列: {} (位置 {}/{})", id, pos + 1, self.pending.len());
        id
    }

    /// 取出排名最前的至多 n 个文件并标记为 Active
    pub fn next(&mut self, n: usize) -> Vec<SharedRecord> {
        let mut selected = Vec::with_capacity(n.min(self.pending.len()));

        while selected.len() < n && !self.pending.is_empty() {
            let entry = self.pending.remove(0);
            let mut r = entry.record.lock();
            // 已离开等待状态的记录直接丢弃
            if r.file.status != FileStatus::Queued {
                debug!("丢弃非等待状态的队列项: {} ({:?})", entry.id, r.file.status);
                continue;
            }
            r.file.mark_active();
            drop(r);
            selected.push(entry.record);
        }

        selected
    }

    /// 从等待队列移除
    pub fn remove(&mut self, id: &str) -> Option<SharedRecord> {
        let pos = self.pending.iter().position(|e| e.id == id)?;
        Some(self.pending.remove(pos).record)
    }

    /// 切换排序策略并重排
    pub fn reprioritize(&mut self, mode: PriorityMode) {
        if mode == self.mode {
            return;
        }
        info!("调度策略切换: {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
        self.pending.sort_by(|a, b| rank(mode, a, b));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
