//! Enclave ID 分配
//!
//! 在这里为 enclave 分配 eid，销毁后 eid 会被回收再次使用。

use alloc::vec::Vec;
use lazy_static::*;
use spin::Mutex;

/// 回收分配器，用于分配和回收 eid
pub struct RecycleAllocator {
    current: usize,       // 下一个从未分配过的 eid
    recycled: Vec<usize>, // 被回收的 eid
}

impl RecycleAllocator {
    pub fn new() -> Self {
        RecycleAllocator {
            current: 0,
            recycled: Vec::new(),
        }
    }
    /// 分配一个 eid，优先使用回收的
    pub fn alloc(&mut self) -> usize {
        if let Some(id) = self.recycled.pop() {
            id
        } else {
            self.current += 1;
            self.current - 1
        }
    }
    /// 回收指定的 eid
    pub fn dealloc(&mut self, id: usize) {
        assert!(id < self.current);
        assert!(
            !self.recycled.iter().any(|i| *i == id),
            "eid {} has been deallocated!",
            id
        );
        self.recycled.push(id);
    }
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// 全局 eid 分配器
    static ref EID_ALLOCATOR: Mutex<RecycleAllocator> = Mutex::new(RecycleAllocator::new());
}

/// eid 句柄，释放时自动回收 eid
#[derive(Debug, PartialEq, Eq)]
pub struct EidHandle(usize);

impl EidHandle {
    pub fn eid(&self) -> usize {
        self.0
    }
}

impl Drop for EidHandle {
    fn drop(&mut self) {
        EID_ALLOCATOR.lock().dealloc(self.0);
    }
}

/// 分配一个新的 eid
pub fn eid_alloc() -> EidHandle {
    EidHandle(EID_ALLOCATOR.lock().alloc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_ids_are_reused_first() {
        let mut ids = RecycleAllocator::new();
        assert_eq!(ids.alloc(), 0);
        assert_eq!(ids.alloc(), 1);
        ids.dealloc(0);
        assert_eq!(ids.alloc(), 0);
        assert_eq!(ids.alloc(), 2);
    }

    #[test]
    #[should_panic(expected = "has been deallocated")]
    fn double_dealloc_panics() {
        let mut ids = RecycleAllocator::new();
        ids.alloc();
        ids.dealloc(0);
        ids.dealloc(0);
    }

    #[test]
    fn handles_are_unique_while_alive() {
        let a = eid_alloc();
        let b = eid_alloc();
        assert_ne!(a, b);
        assert_ne!(a.eid(), b.eid());
    }
}
