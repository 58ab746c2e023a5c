//! Enclave 物理内存 (EPM)
//!
//! EPM 是 enclave 私有的连续物理区域。它的第一页是 enclave 页表的根节点，
//! 之后的中间页表节点和 enclave 私有数据页都按需从同一个空闲链表中取出。

use super::page_table::{PageTable, PageTableEntry, PteKind, TableStore};
use super::region::{Backing, Block, Region};
use super::{
    FrameSource, FreePageList, KernelAddr, PhysAddr, PhysPageNum, VPNRange, VirtAddr, VirtPageNum,
};
use crate::config::{PT_ENTRIES, PT_INDEX_BITS, PT_LEVELS};
use crate::error::{MemError, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Enclave 物理内存
pub struct Epm<S: FrameSource> {
    pub(super) region: Region<S>,
    page_table: Option<PageTable>,
}

/// 向上取整到 2 的幂后的阶
pub(super) fn order_for(pages: usize) -> Result<usize> {
    pages
        .checked_next_power_of_two()
        .map(|count| count.trailing_zeros() as usize)
        .ok_or(MemError::OutOfMemory)
}

impl<S: FrameSource> Epm<S> {
    /// 分配至少 `min_pages` 页的 EPM 并建立根页表
    ///
    /// 优先向伙伴分配器申请 `2^order` 页；失败且启用 `cma` 时改为向一致性
    /// 分配器申请恰好 `min_pages` 页。失败时不留下任何已分配的内存。
    pub fn new(source: Arc<S>, min_pages: usize) -> Result<Self> {
        if min_pages == 0 {
            return Err(MemError::InvalidArgument);
        }
        let order = order_for(min_pages)?;
        let count = 1usize << order;

        let mut block = None;
        // 超过最大阶的请求分配器只会报错，直接跳过
        if order <= source.max_order() {
            block = source.alloc_pages(order).map(|base| Block {
                base,
                phys: source.kernel_to_phys(base),
                pages: count,
                backing: Backing::Buddy { order },
            });
        }

        #[cfg(feature = "cma")]
        if block.is_none() {
            block = Self::alloc_coherent(&source, min_pages)?;
        }

        let Some(block) = block else {
            error!("无法分配 EPM: 需要 {} 页 (order {})", min_pages, order);
            return Err(MemError::OutOfMemory);
        };

        let mut region = Region::from_block(source, block, order)?;
        region.zero();

        // 第一页作为 enclave 的根页表
        let root = region.take_page()?;
        let root_ppn = region.to_phys(root).ok_or(MemError::OutOfMemory)?.floor();
        info!(
            "EPM: {:?} {} 页 ({:?}), 根页表 {:?}",
            block.phys, block.pages, block.backing, root_ppn
        );
        Ok(Self {
            region,
            page_table: Some(PageTable::new(root_ppn)),
        })
    }

    #[cfg(feature = "cma")]
    fn alloc_coherent(source: &Arc<S>, pages: usize) -> Result<Option<Block>> {
        let bytes = pages
            .checked_mul(crate::config::PAGE_SIZE)
            .ok_or(MemError::OutOfMemory)?;
        match source.alloc_coherent(bytes) {
            Some((base, phys)) if phys.0 != 0 => Ok(Some(Block {
                base,
                phys,
                pages,
                backing: Backing::Coherent { bytes, phys },
            })),
            Some((base, phys)) => {
                source.free_coherent(base, bytes, phys);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub(super) fn page_table(&self) -> Result<PageTable> {
        self.page_table.ok_or(MemError::NotInitialized)
    }

    pub fn region(&self) -> &Region<S> {
        &self.region
    }

    pub fn free_list(&self) -> &FreePageList {
        self.region.free_list()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn order(&self) -> usize {
        self.region.order()
    }

    pub fn phys_base(&self) -> Option<PhysAddr> {
        self.region.phys_base()
    }

    /// 根页表的物理地址
    pub fn root_phys(&self) -> Option<PhysAddr> {
        self.page_table.map(|pt| pt.root_ppn().into())
    }

    /// 根页表的内核地址
    pub fn root_table(&self) -> Option<KernelAddr> {
        self.root_phys().and_then(|pa| self.region.to_kernel(pa))
    }

    /// 可写入 satp 的页表令牌
    pub fn token(&self) -> Option<usize> {
        self.page_table.map(|pt| pt.token())
    }

    /// 下一个空闲页的物理地址
    pub fn free_phys(&self) -> Option<PhysAddr> {
        self.region.free_phys()
    }

    /// 物理地址对应的内核地址，EPM 外的地址交给 [`FrameSource`]
    pub(super) fn phys_to_kernel(&self, pa: PhysAddr) -> KernelAddr {
        self.region
            .to_kernel(pa)
            .unwrap_or_else(|| self.region.source().phys_to_kernel(pa))
    }

    /// `va` 所在页映射到的物理页地址；任意一级未映射时返回 `None`
    pub fn translate(&self, va: VirtAddr) -> Result<Option<PhysAddr>> {
        let pt = self.page_table()?;
        Ok(pt
            .translate(&self.region, va.floor())?
            .filter(|pte| pte.is_valid())
            .map(|pte| pte.ppn().into()))
    }

    /// 为从 `start` 开始的 `pages` 个页建好中间页表，不映射叶子页
    ///
    /// 遇到空闲页耗尽或到达地址空间末尾时停止，返回已经完成的页数。
    pub fn alloc_vspace(&mut self, start: VirtAddr, pages: usize) -> usize {
        let Ok(pt) = self.page_table() else {
            return 0;
        };
        let first = start.floor();
        let end = VirtPageNum(first.0.saturating_add(pages).min(VirtPageNum::END.0));
        if first >= end {
            return 0;
        }
        let mut count = 0;
        for vpn in VPNRange::new(first, end) {
            if let Err(err) = pt.find_pte_create(&mut self.region, vpn) {
                debug!("alloc_vspace 在 {:?} 停止: {}", vpn, err);
                break;
            }
            count += 1;
        }
        count
    }

    /// 根页表以及所有可达的中间页表节点
    pub fn table_pages(&self) -> Result<Vec<PhysPageNum>> {
        let mut tables = Vec::new();
        let mut leaves = Vec::new();
        self.collect(&mut tables, &mut leaves)?;
        Ok(tables)
    }

    /// 所有有效的叶子映射
    pub fn leaf_mappings(&self) -> Result<Vec<(VirtPageNum, PageTableEntry)>> {
        let mut tables = Vec::new();
        let mut leaves = Vec::new();
        self.collect(&mut tables, &mut leaves)?;
        Ok(leaves)
    }

    fn collect(
        &self,
        tables: &mut Vec<PhysPageNum>,
        leaves: &mut Vec<(VirtPageNum, PageTableEntry)>,
    ) -> Result<()> {
        let root = self.page_table()?.root_ppn();
        // (节点, 层级, 已确定的 vpn 高位)
        let mut stack = alloc::vec![(root, 0usize, 0usize)];
        while let Some((table, level, prefix)) = stack.pop() {
            tables.push(table);
            for idx in 0..PT_ENTRIES {
                let pte = self.region.read_entry(table, idx)?;
                let vpn = prefix << PT_INDEX_BITS | idx;
                match pte.kind() {
                    PteKind::Invalid => {}
                    PteKind::Table(next) if level + 1 < PT_LEVELS => {
                        stack.push((next, level + 1, vpn))
                    }
                    PteKind::Leaf(..) if level + 1 == PT_LEVELS => {
                        leaves.push((VirtPageNum(vpn), pte))
                    }
                    PteKind::Table(ppn) | PteKind::Leaf(ppn, _) => {
                        return Err(MemError::CorruptTable(ppn.into()))
                    }
                }
            }
        }
        Ok(())
    }

    /// 归还 EPM，包括所有页表节点和数据页。可重复调用
    pub fn destroy(&mut self) {
        self.page_table = None;
        self.region.destroy();
    }
}
