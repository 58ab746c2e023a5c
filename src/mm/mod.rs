// 内存管理实现
// 针对 RV64 的 SV39（可选 SV48）页表，实现 enclave 物理内存 (EPM)、
// 非可信共享内存 (UTM)、空闲页链表以及 enclave 页表的遍历与映射。

mod address; // 地址相关模块
mod epm; // Enclave 物理内存
mod frame_allocator; // 物理页来源
mod free_list; // 空闲页链表
mod mapping; // 页分配策略
pub(crate) mod page_table; // 页表模块
mod region; // 连续物理区域
mod utm; // 非可信共享内存

#[cfg(test)]
pub(crate) mod test_util;
#[cfg(test)]
mod tests_prop;

pub use address::{KernelAddr, PhysAddr, PhysPageNum, StepByOne, VirtAddr, VirtPageNum};
pub use address::{SimpleRange, VPNRange};
pub use epm::Epm;
pub use frame_allocator::{BuddyFrameSource, FrameSource};
pub use free_list::FreePageList;
pub use mapping::PageClass;
pub use page_table::{PTEFlags, PageTable, PageTableEntry, PteKind, PteSlot, TableStore};
pub use region::{Backing, Region};
pub use utm::Utm;
