//! 非可信内存 (UTM)
//!
//! enclave 与宿主共享的缓冲区，总是从伙伴分配器获得。UTM 没有自己的页表，
//! 它的页通过 [`Utm::alloc_page`] 映射进 EPM 的页表。
use super::epm::order_for;
use super::region::{Backing, Block, Region};
use super::{FrameSource, FreePageList, KernelAddr, PhysAddr};
use crate::config::PAGE_SIZE;
use crate::error::{MemError, Result};
use alloc::sync::Arc;

/// 非可信共享内存
pub struct Utm<S: FrameSource> {
    pub(super) region: Region<S>,
    requested: usize,
}

impl<S: FrameSource> Utm<S> {
    /// 分配能容纳 `untrusted_size` 字节的 UTM，页数向上取整到 2 的幂
    pub fn new(source: Arc<S>, untrusted_size: usize) -> Result<Self> {
        if untrusted_size == 0 {
            return Err(MemError::InvalidArgument);
        }
        let pages = untrusted_size
            .checked_add(PAGE_SIZE - 1)
            .ok_or(MemError::OutOfMemory)?
            / PAGE_SIZE;
        let order = order_for(pages)?;
        let count = 1usize << order;
        if order > source.max_order() {
            error!("UTM 过大: {} 字节 (order {})", untrusted_size, order);
            return Err(MemError::OutOfMemory);
        }

        let base = source.alloc_pages(order).ok_or_else(|| {
            error!("无法分配 {} 页 UTM", count);
            MemError::OutOfMemory
        })?;
        let block = Block {
            base,
            phys: source.kernel_to_phys(base),
            pages: count,
            backing: Backing::Buddy { order },
        };

        let size = count * PAGE_SIZE;
        if size != untrusted_size {
            // 不报错，由调用者修正参数
            warn!(
                "共享缓冲区大小 {:#x} 不是 PAGE_SIZE 的 2 的幂倍, 实际分配 {:#x}",
                untrusted_size, size
            );
        }

        let region = Region::from_block(source, block, order)?;
        info!("UTM: {:?} {} 页", block.phys, count);
        Ok(Self {
            region,
            requested: untrusted_size,
        })
    }

    pub fn region(&self) -> &Region<S> {
        &self.region
    }

    pub fn free_list(&self) -> &FreePageList {
        self.region.free_list()
    }

    /// 实际分配的字节数
    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// 调用者请求的字节数
    pub fn requested_size(&self) -> usize {
        self.requested
    }

    pub fn order(&self) -> usize {
        self.region.order()
    }

    pub fn base(&self) -> Option<KernelAddr> {
        self.region.base()
    }

    pub fn phys_base(&self) -> Option<PhysAddr> {
        self.region.phys_base()
    }

    /// 清空空闲链表并归还整块内存，可重复调用
    pub fn destroy(&mut self) {
        self.region.destroy();
    }
}
