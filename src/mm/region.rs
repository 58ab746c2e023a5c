//! 连续物理区域
//!
//! 一个区域是一次性从 [`FrameSource`] 得到的连续内存块，按页切分后放入
//! [`FreePageList`]。块内的页只通过相对块基址的偏移来定位，因此不需要
//! 为已使用的页另外记账：销毁时整块归还即可。

use super::page_table::{PageTableEntry, TableStore};
use super::{FrameSource, FreePageList, KernelAddr, PhysAddr, PhysPageNum};
use crate::config::{PAGE_SIZE, PT_ENTRIES};
use crate::error::{MemError, Result};
use alloc::sync::Arc;
use core::mem::size_of;

/// 区域的后备内存来自哪个分配器
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Backing {
    /// 伙伴分配器，`2^order` 页
    Buddy { order: usize },
    /// 一致性 (DMA) 分配器
    Coherent { bytes: usize, phys: PhysAddr },
}

/// 已经拿到的连续内存块
#[derive(Copy, Clone, Debug)]
pub(crate) struct Block {
    pub base: KernelAddr,
    pub phys: PhysAddr,
    pub pages: usize,
    pub backing: Backing,
}

/// 连续物理区域，EPM 和 UTM 的公共部分
pub struct Region<S: FrameSource> {
    source: Arc<S>,
    block: Option<Block>,
    order: usize,
    free_list: FreePageList,
}

impl<S: FrameSource> Region<S> {
    /// 接管 `block`，并把其中所有页放入空闲链表
    pub(crate) fn from_block(source: Arc<S>, block: Block, order: usize) -> Result<Self> {
        debug_assert!(block.base.aligned());
        let mut region = Self {
            source,
            block: Some(block),
            order,
            free_list: FreePageList::new(),
        };
        // 失败时 region 被丢弃，块随之归还
        region.free_list.populate(block.base, block.pages)?;
        Ok(region)
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// 区域字节数，未初始化或已销毁时为 0
    pub fn size(&self) -> usize {
        self.block.map_or(0, |b| b.pages * PAGE_SIZE)
    }

    /// 区域页数
    pub fn pages(&self) -> usize {
        self.block.map_or(0, |b| b.pages)
    }

    /// 初始化时计算出的阶
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn base(&self) -> Option<KernelAddr> {
        self.block.map(|b| b.base)
    }

    pub fn phys_base(&self) -> Option<PhysAddr> {
        self.block.map(|b| b.phys)
    }

    pub fn backing(&self) -> Option<Backing> {
        self.block.map(|b| b.backing)
    }

    pub fn is_live(&self) -> bool {
        self.block.is_some()
    }

    pub fn free_list(&self) -> &FreePageList {
        &self.free_list
    }

    /// `addr` 是否落在区域内
    pub fn contains(&self, addr: KernelAddr) -> bool {
        self.to_phys(addr).is_some()
    }

    /// 区域内页的物理地址
    pub fn to_phys(&self, addr: KernelAddr) -> Option<PhysAddr> {
        let block = self.block?;
        let offset = addr.0.checked_sub(block.base.0)?;
        (offset < block.pages * PAGE_SIZE).then(|| PhysAddr(block.phys.0 + offset))
    }

    /// 区域内物理地址对应的内核地址
    pub fn to_kernel(&self, pa: PhysAddr) -> Option<KernelAddr> {
        let block = self.block?;
        let offset = pa.0.checked_sub(block.phys.0)?;
        (offset < block.pages * PAGE_SIZE).then(|| block.base.add(offset))
    }

    /// 从空闲链表取出一页
    pub fn take_page(&mut self) -> Result<KernelAddr> {
        if self.block.is_none() {
            return Err(MemError::NotInitialized);
        }
        self.free_list.pop().ok_or(MemError::OutOfMemory)
    }

    /// 空闲链表队头页的物理地址
    pub fn free_phys(&self) -> Option<PhysAddr> {
        self.free_list.peek().and_then(|page| self.to_phys(page))
    }

    /// 把整个区域清零
    pub(crate) fn zero(&mut self) {
        if let Some(block) = self.block {
            unsafe {
                core::ptr::write_bytes(block.base.as_mut_ptr::<u8>(), 0, block.pages * PAGE_SIZE);
            }
        }
    }

    /// 页表节点中第 `idx` 项的指针，节点必须在区域内
    fn entry_ptr(&self, table: PhysPageNum, idx: usize) -> Result<*mut PageTableEntry> {
        assert!(idx < PT_ENTRIES);
        let pa: PhysAddr = table.into();
        let node = self.to_kernel(pa).ok_or(MemError::CorruptTable(pa))?;
        Ok(node.add(idx * size_of::<PageTableEntry>()).as_mut_ptr())
    }

    /// 清空空闲链表并归还整块内存，可重复调用
    pub fn destroy(&mut self) {
        self.free_list.drain();
        let Some(block) = self.block.take() else {
            return;
        };
        match block.backing {
            Backing::Buddy { order } => self.source.free_pages(block.base, order),
            Backing::Coherent { bytes, phys } => self.source.free_coherent(block.base, bytes, phys),
        }
        info!("释放区域 {:?} ({} 页)", block.phys, block.pages);
    }
}

impl<S: FrameSource> TableStore for Region<S> {
    fn read_entry(&self, table: PhysPageNum, idx: usize) -> Result<PageTableEntry> {
        let ptr = self.entry_ptr(table, idx)?;
        Ok(unsafe { ptr.read() })
    }

    fn write_entry(&mut self, table: PhysPageNum, idx: usize, pte: PageTableEntry) -> Result<()> {
        let ptr = self.entry_ptr(table, idx)?;
        unsafe { ptr.write(pte) };
        Ok(())
    }

    fn alloc_table(&mut self) -> Result<PhysPageNum> {
        let page = self.take_page()?;
        unsafe {
            core::ptr::write_bytes(page.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
        }
        let pa = self.to_phys(page).ok_or(MemError::OutOfMemory)?;
        Ok(pa.floor())
    }
}

impl<S: FrameSource> Drop for Region<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}
