//! 任务与延时任务队列
//! 跨线程提交的任务在事件循环线程上执行；延时任务按截止时间排序

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::LoopContext;

/// 在事件循环线程上执行的任务
pub type Task = Box<dyn FnOnce(&mut LoopContext) + Send + 'static>;

/// 延时任务句柄，可在执行前取消
#[derive(Debug, Clone)]
pub struct DelayedTask {
    canceled: Arc<AtomicBool>,
    deadline: Instant,
}

impl DelayedTask {
    pub(crate) fn new(deadline: Instant) -> Self {
        Self {
            canceled: Arc::new(AtomicBool::new(false)),
            deadline,
        }
    }

    /// 取消任务；任务已开始执行时无效
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

struct Entry {
    deadline: Instant,
    /// 同一截止时间按提交顺序执行
    seq: u64,
    canceled: Arc<AtomicBool>,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // 反向比较得到最小堆
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// 按截止时间排序的延时任务队列，只在事件循环线程上访问
#[derive(Default)]
pub(crate) struct DelayedQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl DelayedQueue {
    pub(crate) fn push(&mut self, handle: &DelayedTask, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline: handle.deadline,
            seq,
            canceled: Arc::clone(&handle.canceled),
            task,
        });
    }

    /// 最早的未取消截止时间，顺带丢弃堆顶已取消的任务
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if top.canceled.load(Ordering::Acquire) {
                self.heap.pop();
            } else {
                return Some(top.deadline);
            }
        }
        None
    }

    /// 取出一个已到期且未取消的任务
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Task> {
        while self.heap.peek().is_some_and(|e| e.deadline <= now) {
            let entry = self.heap.pop()?;
            if !entry.canceled.load(Ordering::Acquire) {
                return Some(entry.task);
            }
        }
        None
    }

    /// 取出任意一个未取消的任务（按截止时间顺序），用于停机时的最终排空
    pub(crate) fn pop_any(&mut self) -> Option<Task> {
        while let Some(entry) = self.heap.pop() {
            if !entry.canceled.load(Ordering::Acquire) {
                return Some(entry.task);
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
