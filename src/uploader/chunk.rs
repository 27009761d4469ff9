// 上传分片计划
//
// - 文件按固定分片大小切分，最后一片截断
// - 空文件也有一个空分片，保证走完整的上传流程
// - 每个分片在 pending / in_flight / done / failed 之间流转

use crate::config::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::uploader::transport::ChunkReceipt;
use std::ops::Range;
use tracing::debug;

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// 上传分片信息
#[derive(Debug, Clone)]
pub struct UploadChunk {
    pub index: usize,
    pub range: Range<u64>,
    pub state: ChunkState,
    /// 已重试次数
    pub retries: u32,
    pub receipt: Option<ChunkReceipt>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            state: ChunkState::Pending,
            retries: 0,
            receipt: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 单文件分片计划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    chunks: Vec<UploadChunk>,
    total_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// 创建分片计划
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `chunk_size` - 分片大小（限制在允许范围内）
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        let chunks = if total_size == 0 {
            vec![UploadChunk::new(0, 0..0)]
        } else {
            Self::calculate_chunks(total_size, chunk_size)
        };

        debug!(
            "创建分片计划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Self {
            chunks,
            total_size,
            chunk_size,
        }
    }

    fn calculate_chunks(total_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
        let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
        let mut offset = 0u64;

        while offset < total_size {
            let end = std::cmp::min(offset + chunk_size, total_size);
            chunks.push(UploadChunk::new(chunks.len(), offset..end));
            offset = end;
        }

        chunks
    }

    /// 下一个待上传分片的索引
    pub fn next_pending(&self) -> Option<usize> {
        self.chunks
            .iter()
            .find(|c| c.state == ChunkState::Pending)
            .map(|c| c.index)
    }

    pub fn chunk(&self, index: usize) -> Option<&UploadChunk> {
        self.chunks.get(index)
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn completed_count(&self) -> usize {
        self.count(ChunkState::Done)
    }

    fn count(&self, state: ChunkState) -> usize {
        self.chunks.iter().filter(|c| c.state == state).count()
    }

    /// 已完成分片的字节数
    pub fn done_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.state == ChunkState::Done)
            .map(|c| c.size())
            .sum()
    }

    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.state == ChunkState::Done)
    }

    pub fn mark_in_flight(&mut self, index: usize) {
        self.set_state(index, ChunkState::InFlight);
    }

    pub fn mark_done(&mut self, index: usize, receipt: ChunkReceipt) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.state = ChunkState::Done;
            chunk.receipt = Some(receipt);
        }
    }

    pub fn mark_failed(&mut self, index: usize) {
        self.set_state(index, ChunkState::Failed);
    }

    /// 放回待上传（上传目标过期、传输被中断）
    pub fn mark_pending(&mut self, index: usize) {
        self.set_state(index, ChunkState::Pending);
    }

    fn set_state(&mut self, index: usize, state: ChunkState) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            if chunk.state != ChunkState::Done {
                chunk.state = state;
            }
        }
    }

    pub fn set_retries(&mut self, index: usize, retries: u32) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.retries = retries;
        }
    }

    /// 按分片顺序排列的回执（用于合并）
    pub fn receipts(&self) -> Vec<ChunkReceipt> {
        self.chunks.iter().filter_map(|c| c.receipt.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn receipt(index: usize, size: u64) -> ChunkReceipt {
        ChunkReceipt {
            index,
            size,
            etag: Some(format!("etag_{}", index)),
        }
    }

    #[test]
    fn test_chunk_calculation() {
        let plan = ChunkPlan::new(30 * MB, 10 * MB);
        assert_eq!(plan.chunk_count(), 3);
        assert_eq!(plan.chunks()[2].range, (20 * MB)..(30 * MB));

        // 最后一片截断
        let plan = ChunkPlan::new(25 * MB, 10 * MB);
        assert_eq!(plan.chunk_count(), 3);
        assert_eq!(plan.chunks()[2].size(), 5 * MB);
    }

    #[test]
    fn test_small_and_empty_files() {
        let plan = ChunkPlan::new(1000, 10 * MB);
        assert_eq!(plan.chunk_count(), 1);
        assert_eq!(plan.chunks()[0].range, 0..1000);

        let plan = ChunkPlan::new(0, 10 * MB);
        assert_eq!(plan.chunk_count(), 1);
        assert_eq!(plan.chunks()[0].size(), 0);
    }

    #[test]
    fn test_chunk_size_clamping() {
        // 太小的分片被提升到最小值
        let plan = ChunkPlan::new(MB, 1);
        assert_eq!(plan.chunk_size(), MIN_CHUNK_SIZE);
        assert_eq!(plan.chunk_count(), 4);
    }

    #[test]
    fn test_state_flow() {
        let mut plan = ChunkPlan::new(30 * MB, 10 * MB);
        assert_eq!(plan.next_pending(), Some(0));

        plan.mark_in_flight(0);
        plan.mark_in_flight(1);
        assert_eq!(plan.next_pending(), Some(2));

        plan.mark_done(0, receipt(0, 10 * MB));
        assert_eq!(plan.done_bytes(), 10 * MB);
        assert_eq!(plan.completed_count(), 1);

        // 完成的分片不会被放回
        plan.mark_pending(0);
        assert_eq!(plan.chunk(0).map(|c| c.state), Some(ChunkState::Done));

        // 过期的在途分片放回待上传
        plan.mark_pending(1);
        assert_eq!(plan.next_pending(), Some(1));
    }

    #[test]
    fn test_receipts_and_completion() {
        let mut plan = ChunkPlan::new(20 * MB, 10 * MB);
        plan.mark_done(1, receipt(1, 10 * MB));
        plan.mark_done(0, receipt(0, 10 * MB));

        assert!(plan.is_completed());
        let receipts = plan.receipts();
        assert_eq!(receipts[0].index, 0);
        assert_eq!(receipts[1].index, 1);
    }

    #[test]
    fn test_failed_chunk_keeps_retry_count() {
        let mut plan = ChunkPlan::new(20 * MB, 10 * MB);
        plan.mark_done(0, receipt(0, 10 * MB));
        plan.set_retries(1, 2);
        plan.mark_failed(1);

        assert_eq!(plan.next_pending(), None);
        assert!(!plan.is_completed());
        assert_eq!(plan.chunk(1).map(|c| (c.state, c.retries)), Some((ChunkState::Failed, 2)));
        assert_eq!(plan.completed_count(), 1);
    }
}
