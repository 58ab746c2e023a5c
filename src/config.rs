//! 内存引擎使用的常量

/// 页大小 4KiB
pub const PAGE_SIZE: usize = 0x1000;
/// 页内偏移位宽
pub const PAGE_SIZE_BITS: usize = 0xc;

/// 伙伴分配器一次可分配的最大阶
pub const MAX_ORDER: usize = 10;

/// 每级页表索引的位宽
pub const PT_INDEX_BITS: usize = 9;
/// 每个页表节点中的页表项数量
pub const PT_ENTRIES: usize = 1 << PT_INDEX_BITS;

/// 页表级数
#[cfg(not(feature = "sv48"))]
pub const PT_LEVELS: usize = 3;
#[cfg(feature = "sv48")]
pub const PT_LEVELS: usize = 4;

/// satp 中的分页模式
#[cfg(not(feature = "sv48"))]
pub const SATP_MODE: usize = 8;
#[cfg(feature = "sv48")]
pub const SATP_MODE: usize = 9;
