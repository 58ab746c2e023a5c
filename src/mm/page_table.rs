//! 实现 [`PageTableEntry`] 和 enclave 页表的遍历。
//!
//! 页表项的硬件位布局只在这里解释，上层通过 [`PteKind`] 区分
//! 无效项、指向下一级页表的指针项和叶子项。

use super::{PhysPageNum, VirtPageNum};
use crate::config::{PT_LEVELS, SATP_MODE};
use crate::error::{MemError, Result};
use bitflags::*;

bitflags! {
    /// 页表项标志
    pub struct PTEFlags: u8 {
        const V = 1 << 0;  // 有效位
        const R = 1 << 1;  // 可读位
        const W = 1 << 2;  // 可写位
        const X = 1 << 3;  // 可执行位
        const U = 1 << 4;  // 用户态访问位
        const G = 1 << 5;  // 全局位
        const A = 1 << 6;  // 已访问位
        const D = 1 << 7;  // 已修改位
    }
}

const PPN_SHIFT: usize = 10;
const PPN_BITS: usize = 44;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(C)]
/// 页表项结构
pub struct PageTableEntry {
    /// 页表项的比特位
    pub bits: usize,
}

/// 解码后的页表项
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PteKind {
    /// 无效项
    Invalid,
    /// 指向下一级页表
    Table(PhysPageNum),
    /// 叶子项，映射到一个数据页
    Leaf(PhysPageNum, PTEFlags),
}

impl PageTableEntry {
    /// 创建新的页表项
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << PPN_SHIFT | flags.bits() as usize,
        }
    }
    /// 创建空的页表项
    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }
    /// 指向下一级页表的指针项，只设置有效位
    pub fn table(ppn: PhysPageNum) -> Self {
        Self::new(ppn, PTEFlags::V)
    }
    /// 物理页号
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> PPN_SHIFT & ((1usize << PPN_BITS) - 1)).into()
    }
    /// 标志位
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }
    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }
    /// 按硬件规则解码：R/W/X 全为 0 的有效项是指针项
    pub fn kind(&self) -> PteKind {
        let flags = self.flags();
        if !flags.contains(PTEFlags::V) {
            PteKind::Invalid
        } else if flags.intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X) {
            PteKind::Leaf(self.ppn(), flags)
        } else {
            PteKind::Table(self.ppn())
        }
    }
}

/// 页表节点的存储。页表遍历通过它读写页表项并获取新的中间节点
pub trait TableStore {
    /// 读取 `table` 节点中第 `idx` 项
    fn read_entry(&self, table: PhysPageNum, idx: usize) -> Result<PageTableEntry>;
    /// 写入 `table` 节点中第 `idx` 项
    fn write_entry(&mut self, table: PhysPageNum, idx: usize, pte: PageTableEntry) -> Result<()>;
    /// 取一个清零的页作为新的中间节点
    fn alloc_table(&mut self) -> Result<PhysPageNum>;
}

/// 叶子页表项所在的位置
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PteSlot {
    /// 末级页表节点
    pub table: PhysPageNum,
    /// 节点内的索引
    pub index: usize,
}

/// enclave 页表，只记录根节点；节点本身存放在 EPM 中
#[derive(Copy, Clone, Debug)]
pub struct PageTable {
    root_ppn: PhysPageNum,
}

impl PageTable {
    pub fn new(root_ppn: PhysPageNum) -> Self {
        Self { root_ppn }
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    /// 根据虚拟页号查找叶子页表项的位置，中间节点缺失时从 `store` 中创建
    pub fn find_pte_create<T: TableStore>(
        &self,
        store: &mut T,
        vpn: VirtPageNum,
    ) -> Result<PteSlot> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (level, idx) in idxs[..PT_LEVELS - 1].iter().enumerate() {
            let pte = store.read_entry(ppn, *idx)?;
            ppn = match pte.kind() {
                PteKind::Table(next) => next,
                PteKind::Invalid => {
                    let next = store.alloc_table()?;
                    trace!("level {} idx {}: 新建页表节点 {:?}", level, idx, next);
                    store.write_entry(ppn, *idx, PageTableEntry::table(next))?;
                    next
                }
                PteKind::Leaf(leaf, _) => return Err(MemError::CorruptTable(leaf.into())),
            };
        }
        Ok(PteSlot {
            table: ppn,
            index: idxs[PT_LEVELS - 1],
        })
    }

    /// 根据虚拟页号查找叶子页表项的位置，任何一级无效时返回 `None`
    pub fn find_pte<T: TableStore>(&self, store: &T, vpn: VirtPageNum) -> Result<Option<PteSlot>> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for idx in idxs[..PT_LEVELS - 1].iter() {
            match store.read_entry(ppn, *idx)?.kind() {
                PteKind::Table(next) => ppn = next,
                PteKind::Invalid => return Ok(None),
                PteKind::Leaf(leaf, _) => return Err(MemError::CorruptTable(leaf.into())),
            }
        }
        Ok(Some(PteSlot {
            table: ppn,
            index: idxs[PT_LEVELS - 1],
        }))
    }

    /// 虚拟页号对应的叶子页表项；中间级未映射时返回 `None`
    pub fn translate<T: TableStore>(
        &self,
        store: &T,
        vpn: VirtPageNum,
    ) -> Result<Option<PageTableEntry>> {
        match self.find_pte(store, vpn)? {
            Some(slot) => store.read_entry(slot.table, slot.index).map(Some),
            None => Ok(None),
        }
    }

    /// 可写入 satp 的页表令牌
    pub fn token(&self) -> usize {
        SATP_MODE << 60 | self.root_ppn.0
    }
}
