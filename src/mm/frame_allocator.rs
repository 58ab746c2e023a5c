//! 定义 [`FrameSource`]：区域向宿主内核申请、归还连续物理页的接口，
//! 以及基于伙伴系统的实现 [`BuddyFrameSource`]。
use super::{KernelAddr, PhysAddr, PhysPageNum};
use crate::config::MAX_ORDER;
use buddy_system_allocator::FrameAllocator;
use spin::Mutex;

/// 宿主内核提供的物理页来源
///
/// 方法都只取 `&self`，同一个来源可以被 EPM 和 UTM 共享，实现者自行加锁。
pub trait FrameSource {
    /// `alloc_pages` 支持的最大阶
    fn max_order(&self) -> usize;
    /// 分配 `2^order` 个连续页，返回其内核映射地址
    fn alloc_pages(&self, order: usize) -> Option<KernelAddr>;
    /// 归还 `alloc_pages` 得到的页
    fn free_pages(&self, addr: KernelAddr, order: usize);
    /// 分配 `bytes` 字节的一致性 (DMA) 内存，返回内核地址和物理地址
    fn alloc_coherent(&self, _bytes: usize) -> Option<(KernelAddr, PhysAddr)> {
        None
    }
    /// 归还 `alloc_coherent` 得到的内存
    fn free_coherent(&self, _addr: KernelAddr, _bytes: usize, _phys: PhysAddr) {}
    /// 内核线性映射地址转物理地址
    fn kernel_to_phys(&self, addr: KernelAddr) -> PhysAddr;
    /// 物理地址转内核线性映射地址
    fn phys_to_kernel(&self, pa: PhysAddr) -> KernelAddr;
}

/// 管理一段线性映射物理内存的伙伴分配器
///
/// 内核地址 = 物理地址 + `offset`（按模运算）。
pub struct BuddyFrameSource {
    frames: Mutex<FrameAllocator>,
    offset: usize,
    max_order: usize,
}

impl BuddyFrameSource {
    /// 用 `[start, end)` 的物理页初始化
    pub fn new(start: PhysPageNum, end: PhysPageNum, offset: usize) -> Self {
        let mut frames = FrameAllocator::new();
        frames.add_frame(start.0, end.0);
        info!(
            "伙伴分配器: {:?}..{:?}, 共 {} 页",
            start,
            end,
            end.0.saturating_sub(start.0)
        );
        Self {
            frames: Mutex::new(frames),
            offset,
            max_order: MAX_ORDER,
        }
    }

    /// 修改最大阶
    pub fn set_max_order(&mut self, max_order: usize) {
        self.max_order = max_order;
    }
}

impl FrameSource for BuddyFrameSource {
    fn max_order(&self) -> usize {
        self.max_order
    }

    fn alloc_pages(&self, order: usize) -> Option<KernelAddr> {
        let ppn = self.frames.lock().alloc(1 << order)?;
        Some(self.phys_to_kernel(PhysPageNum(ppn).into()))
    }

    fn free_pages(&self, addr: KernelAddr, order: usize) {
        let ppn = self.kernel_to_phys(addr).floor();
        self.frames.lock().dealloc(ppn.0, 1 << order);
    }

    fn kernel_to_phys(&self, addr: KernelAddr) -> PhysAddr {
        PhysAddr(addr.0.wrapping_sub(self.offset))
    }

    fn phys_to_kernel(&self, pa: PhysAddr) -> KernelAddr {
        KernelAddr(pa.0.wrapping_add(self.offset))
    }
}
