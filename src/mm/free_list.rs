//! 空闲页链表
//!
//! 按插入顺序 (FIFO) 保存一个区域中尚未使用的页。链表中的页既不是页表节点，
//! 也没有被任何叶子页表项引用，因此链表本身就是区域中空闲页的全部记录。

use super::KernelAddr;
use crate::config::PAGE_SIZE;
use crate::error::{MemError, Result};
use alloc::collections::VecDeque;

/// 空闲页链表
#[derive(Default)]
pub struct FreePageList {
    pages: VecDeque<KernelAddr>,
}

impl FreePageList {
    pub fn new() -> Self {
        Self {
            pages: VecDeque::new(),
        }
    }

    /// 放回一页到队尾。记录节点分配失败时返回 `OutOfMemory`
    pub fn push(&mut self, page: KernelAddr) -> Result<()> {
        debug_assert!(page.aligned(), "{:?} 未按页对齐", page);
        debug_assert!(!self.pages.contains(&page), "{:?} 重复放回空闲链表", page);
        self.pages
            .try_reserve(1)
            .map_err(|_| MemError::OutOfMemory)?;
        self.pages.push_back(page);
        Ok(())
    }

    /// 从队头取出一页
    pub fn pop(&mut self) -> Option<KernelAddr> {
        self.pages.pop_front()
    }

    /// 队头的页，不取出
    pub fn peek(&self) -> Option<KernelAddr> {
        self.pages.front().copied()
    }

    /// 把从 `base` 开始的 `count` 个连续页放入链表
    pub fn populate(&mut self, base: KernelAddr, count: usize) -> Result<()> {
        self.pages
            .try_reserve(count)
            .map_err(|_| MemError::OutOfMemory)?;
        for i in 0..count {
            self.pages.push_back(base.add(i * PAGE_SIZE));
        }
        Ok(())
    }

    /// 丢弃所有记录，不归还页本身
    pub fn drain(&mut self) {
        self.pages.clear();
        self.pages.shrink_to_fit();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page: KernelAddr) -> bool {
        self.pages.contains(&page)
    }

    pub fn iter(&self) -> impl Iterator<Item = KernelAddr> + '_ {
        self.pages.iter().copied()
    }
}
