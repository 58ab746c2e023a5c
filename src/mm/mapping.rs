//! 页分配策略：把一个 enclave 虚拟页映射到 EPM 或 UTM 中的物理页。
//!
//! 对同一虚拟地址重复分配总是返回已经映射的页，不会覆盖原有映射，
//! 传入的权限在这种情况下被忽略。这使得地址空间的构建可以安全地重试。

use super::epm::Epm;
use super::page_table::{PageTableEntry, TableStore};
use super::region::Region;
use super::utm::Utm;
use super::{FrameSource, KernelAddr, PTEFlags, VirtAddr};
use crate::error::{MemError, Result};

/// 页的类别，编号与控制面 ioctl 中的取值一致
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PageClass {
    /// 运行时数据页
    RuntimeNoExec = 0,
    /// 用户数据页
    UserNoExec = 1,
    /// 运行时代码页
    RuntimeExec = 2,
    /// 用户代码页
    UserExec = 3,
    /// 与宿主共享的页，来自 UTM
    Untrusted = 4,
}

impl PageClass {
    /// 该类页的叶子权限，均带有 A、D 位
    pub fn flags(self) -> PTEFlags {
        let base = PTEFlags::A | PTEFlags::D | PTEFlags::R | PTEFlags::W;
        match self {
            PageClass::RuntimeNoExec | PageClass::Untrusted => base,
            PageClass::RuntimeExec => base | PTEFlags::X,
            PageClass::UserNoExec => base | PTEFlags::U,
            PageClass::UserExec => base | PTEFlags::U | PTEFlags::X,
        }
    }

    /// 是否由 UTM 提供物理页
    pub fn is_untrusted(self) -> bool {
        self == PageClass::Untrusted
    }
}

impl TryFrom<usize> for PageClass {
    type Error = MemError;

    fn try_from(code: usize) -> Result<Self> {
        match code {
            0 => Ok(PageClass::RuntimeNoExec),
            1 => Ok(PageClass::UserNoExec),
            2 => Ok(PageClass::RuntimeExec),
            3 => Ok(PageClass::UserExec),
            4 => Ok(PageClass::Untrusted),
            _ => Err(MemError::InvalidPageClass(code)),
        }
    }
}

/// 在 `epm` 的页表中映射 `va`，新页从 `pool` 中取出；`pool` 为 `None` 时用 EPM 自己的页
fn map_page<S: FrameSource>(
    epm: &mut Epm<S>,
    pool: Option<&mut Region<S>>,
    va: VirtAddr,
    flags: PTEFlags,
) -> Result<KernelAddr> {
    // 没有 R/W/X 的叶子会被硬件当作指针项
    if !flags.intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X) {
        return Err(MemError::InvalidArgument);
    }
    let pt = epm.page_table()?;
    let slot = pt.find_pte_create(&mut epm.region, va.floor())?;
    let pte = epm.region.read_entry(slot.table, slot.index)?;

    // 已经分配过则直接返回原来的页
    if pte.is_valid() {
        let pa = pte.ppn().into();
        let existing = pool
            .and_then(|pool| pool.to_kernel(pa))
            .unwrap_or_else(|| epm.phys_to_kernel(pa));
        return Ok(existing);
    }

    let pool = match pool {
        Some(pool) => pool,
        None => &mut epm.region,
    };
    let page = pool.take_page().map_err(|err| {
        error!("映射 {:?} 失败: {}", va, err);
        err
    })?;
    let ppn = pool.to_phys(page).ok_or(MemError::OutOfMemory)?.floor();
    epm.region
        .write_entry(slot.table, slot.index, PageTableEntry::new(ppn, flags | PTEFlags::V))?;
    trace!("{:?} -> {:?} ({:?})", va, ppn, flags);
    Ok(page)
}

impl<S: FrameSource> Epm<S> {
    /// 用 EPM 的空闲页映射 `va`，返回页的内核地址
    pub fn alloc_page(&mut self, va: VirtAddr, flags: PTEFlags) -> Result<KernelAddr> {
        map_page(self, None, va, flags)
    }

    /// 运行时代码页
    pub fn alloc_rt_page(&mut self, va: VirtAddr) -> Result<KernelAddr> {
        self.alloc_page(va, PageClass::RuntimeExec.flags())
    }

    /// 运行时数据页
    pub fn alloc_rt_page_noexec(&mut self, va: VirtAddr) -> Result<KernelAddr> {
        self.alloc_page(va, PageClass::RuntimeNoExec.flags())
    }

    /// 用户代码页
    pub fn alloc_user_page(&mut self, va: VirtAddr) -> Result<KernelAddr> {
        self.alloc_page(va, PageClass::UserExec.flags())
    }

    /// 用户数据页
    pub fn alloc_user_page_noexec(&mut self, va: VirtAddr) -> Result<KernelAddr> {
        self.alloc_page(va, PageClass::UserNoExec.flags())
    }
}

impl<S: FrameSource> Utm<S> {
    /// 用 UTM 的空闲页映射 `va`，页表节点仍然来自 `epm`
    pub fn alloc_page(
        &mut self,
        epm: &mut Epm<S>,
        va: VirtAddr,
        flags: PTEFlags,
    ) -> Result<KernelAddr> {
        map_page(epm, Some(&mut self.region), va, flags)
    }

    /// 共享数据页
    pub fn alloc_shared_page(&mut self, epm: &mut Epm<S>, va: VirtAddr) -> Result<KernelAddr> {
        self.alloc_page(epm, va, PageClass::Untrusted.flags())
    }
}
