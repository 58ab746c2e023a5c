//! 物理地址、enclave 虚拟地址、内核映射地址及页号的实现
use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS, PT_INDEX_BITS, PT_LEVELS};
use core::fmt::{self, Debug, Formatter};

const PA_WIDTH: usize = 56; // 物理地址位宽
const VA_WIDTH: usize = PAGE_SIZE_BITS + PT_LEVELS * PT_INDEX_BITS; // 虚拟地址位宽
const PPN_WIDTH: usize = PA_WIDTH - PAGE_SIZE_BITS; // 物理页号位宽
const VPN_WIDTH: usize = VA_WIDTH - PAGE_SIZE_BITS; // 虚拟页号位宽

/// 物理地址
#[repr(C)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PhysAddr(pub usize);

/// enclave 地址空间中的虚拟地址
#[repr(C)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct VirtAddr(pub usize);

/// 物理页号（PPN）
#[repr(C)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PhysPageNum(pub usize);

/// 虚拟页号（VPN）
#[repr(C)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct VirtPageNum(pub usize);

/// 宿主内核可以直接访问的页地址（内核线性映射地址）
#[repr(C)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct KernelAddr(pub usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VA:{:#x}", self.0))
    }
}
impl Debug for VirtPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VPN:{:#x}", self.0))
    }
}
impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PA:{:#x}", self.0))
    }
}
impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PPN:{:#x}", self.0))
    }
}
impl Debug for KernelAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("KA:{:#x}", self.0))
    }
}

impl From<usize> for PhysAddr {
    fn from(v: usize) -> Self {
        Self(v & ((1 << PA_WIDTH) - 1))
    }
}
impl From<usize> for PhysPageNum {
    fn from(v: usize) -> Self {
        Self(v & ((1 << PPN_WIDTH) - 1))
    }
}
impl From<usize> for VirtAddr {
    fn from(v: usize) -> Self {
        Self(v & ((1 << VA_WIDTH) - 1)) // 只保留低 VA_WIDTH 位，高位是符号扩展
    }
}
impl From<usize> for VirtPageNum {
    fn from(v: usize) -> Self {
        Self(v & ((1 << VPN_WIDTH) - 1))
    }
}
impl From<usize> for KernelAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}
impl From<PhysAddr> for usize {
    fn from(v: PhysAddr) -> Self {
        v.0
    }
}
impl From<PhysPageNum> for usize {
    fn from(v: PhysPageNum) -> Self {
        v.0
    }
}
impl From<VirtAddr> for usize {
    fn from(v: VirtAddr) -> Self {
        if v.0 >= (1 << (VA_WIDTH - 1)) {
            v.0 | (!((1 << VA_WIDTH) - 1)) // 符号扩展
        } else {
            v.0
        }
    }
}
impl From<VirtPageNum> for usize {
    fn from(v: VirtPageNum) -> Self {
        v.0
    }
}
impl From<KernelAddr> for usize {
    fn from(v: KernelAddr) -> Self {
        v.0
    }
}

impl VirtAddr {
    /// 所在页的页号（下取整）
    pub fn floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 / PAGE_SIZE)
    }

    /// 页内偏移
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// 是否按页对齐
    pub fn aligned(&self) -> bool {
        self.page_offset() == 0
    }
}
impl From<VirtPageNum> for VirtAddr {
    fn from(v: VirtPageNum) -> Self {
        Self(v.0 << PAGE_SIZE_BITS)
    }
}

impl PhysAddr {
    /// 所在页的页号（下取整）
    pub fn floor(&self) -> PhysPageNum {
        PhysPageNum(self.0 / PAGE_SIZE)
    }

    /// 页内偏移
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// 是否按页对齐
    pub fn aligned(&self) -> bool {
        self.page_offset() == 0
    }
}
impl From<PhysAddr> for PhysPageNum {
    fn from(v: PhysAddr) -> Self {
        assert_eq!(v.page_offset(), 0);
        v.floor()
    }
}
impl From<PhysPageNum> for PhysAddr {
    fn from(v: PhysPageNum) -> Self {
        Self(v.0 << PAGE_SIZE_BITS)
    }
}

impl KernelAddr {
    /// 是否按页对齐
    pub fn aligned(&self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// 向后偏移 `bytes` 字节
    pub fn add(&self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}

impl VirtPageNum {
    /// 地址空间最后一页之后的页号
    pub const END: Self = Self(1 << VPN_WIDTH);

    /// 各级页表中的索引，`[0]` 为根页表
    pub fn indexes(&self) -> [usize; PT_LEVELS] {
        let mut vpn = self.0;
        let mut idx = [0usize; PT_LEVELS];
        for i in (0..PT_LEVELS).rev() {
            idx[i] = vpn & ((1 << PT_INDEX_BITS) - 1);
            vpn >>= PT_INDEX_BITS;
        }
        idx
    }
}

/// 用于遍历页号的迭代器
pub trait StepByOne {
    fn step(&mut self);
}
impl StepByOne for VirtPageNum {
    fn step(&mut self) {
        self.0 += 1;
    }
}
impl StepByOne for PhysPageNum {
    fn step(&mut self) {
        self.0 += 1;
    }
}

#[derive(Copy, Clone)]
/// 左闭右开的页号范围
pub struct SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    l: T,
    r: T,
}
impl<T> SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    pub fn new(start: T, end: T) -> Self {
        assert!(start <= end, "start {:?} > end {:?}!", start, end);
        Self { l: start, r: end }
    }
}
impl<T> IntoIterator for SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    type IntoIter = SimpleRangeIterator<T>;
    fn into_iter(self) -> Self::IntoIter {
        SimpleRangeIterator::new(self.l, self.r)
    }
}

/// [`SimpleRange`] 的迭代器
pub struct SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    current: T,
    end: T,
}
impl<T> SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    pub fn new(l: T, r: T) -> Self {
        Self { current: l, end: r }
    }
}
impl<T> Iterator for SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    fn next(&mut self) -> Option<Self::Item> {
        if self.current == self.end {
            None
        } else {
            let t = self.current;
            self.current.step();
            Some(t)
        }
    }
}

/// 虚拟页号范围
pub type VPNRange = SimpleRange<VirtPageNum>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_split_vpn_top_level_first() {
        let va = VirtAddr::from((1usize << 30) | (2 << 21) | (3 << 12) | 0x45);
        let idx = va.floor().indexes();
        assert_eq!(idx[PT_LEVELS - 1], 3);
        assert_eq!(idx[PT_LEVELS - 2], 2);
        assert_eq!(idx[PT_LEVELS - 3], 1);
        assert_eq!(va.page_offset(), 0x45);
    }

    #[cfg(not(feature = "sv48"))]
    #[test]
    fn high_half_address_is_sign_extended() {
        let va = VirtAddr::from(0xffff_ffff_c000_0000usize);
        assert_eq!(va.0, 0x7f_c000_0000);
        assert_eq!(va.floor().indexes(), [511, 0, 0]);
        assert_eq!(usize::from(va), 0xffff_ffff_c000_0000);
    }

    #[test]
    fn vpn_range_is_half_open() {
        let range = VPNRange::new(VirtPageNum(4), VirtPageNum(7));
        let pages: alloc::vec::Vec<_> = range.into_iter().collect();
        assert_eq!(pages, [VirtPageNum(4), VirtPageNum(5), VirtPageNum(6)]);
    }
}
