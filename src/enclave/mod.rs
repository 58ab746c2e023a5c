//! 按 enclave 组织的内存
//!
//! [`EnclaveMemory`] 把一个 enclave 的 EPM 和 UTM 放在一起，按页类别分配页；
//! [`EnclaveTable`] 按 eid 保存所有 enclave。每个 enclave 都放在自己的锁里，
//! 持有锁即持有对其 EPM/UTM 的独占访问权，不同 enclave 之间互不影响。

mod id;

pub use id::{eid_alloc, EidHandle, RecycleAllocator};

use crate::error::{MemError, Result};
use crate::mm::{Epm, FrameSource, KernelAddr, PageClass, PhysAddr, Utm, VirtAddr};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

/// 创建 enclave 后返回给用户态的内存布局
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryLayout {
    /// EPM 物理基址
    pub epm_paddr: usize,
    /// EPM 字节数
    pub epm_size: usize,
    /// UTM 物理基址，没有 UTM 时为 0
    pub utm_paddr: usize,
    /// UTM 字节数
    pub utm_size: usize,
    /// 根页表的物理地址
    pub pt_ptr: usize,
    /// EPM 中下一个空闲页的物理地址
    pub free_paddr: usize,
    /// UTM 中下一个空闲页的物理地址
    pub utm_free_ptr: usize,
}

/// 一个 enclave 的全部内存
pub struct EnclaveMemory<S: FrameSource> {
    source: Arc<S>,
    epm: Epm<S>,
    utm: Option<Utm<S>>,
}

impl<S: FrameSource> EnclaveMemory<S> {
    /// 分配至少 `min_pages` 页的 EPM
    pub fn new(source: Arc<S>, min_pages: usize) -> Result<Self> {
        let epm = Epm::new(source.clone(), min_pages)?;
        Ok(Self {
            source,
            epm,
            utm: None,
        })
    }

    /// 分配 `untrusted_size` 字节的 UTM
    pub fn init_utm(&mut self, untrusted_size: usize) -> Result<()> {
        if !self.epm.region().is_live() {
            return Err(MemError::NotInitialized);
        }
        if self.utm.as_ref().is_some_and(|utm| utm.region().is_live()) {
            return Err(MemError::UtmAlreadyInitialized);
        }
        self.utm = Some(Utm::new(self.source.clone(), untrusted_size)?);
        Ok(())
    }

    pub fn epm(&self) -> &Epm<S> {
        &self.epm
    }

    pub fn utm(&self) -> Option<&Utm<S>> {
        self.utm.as_ref()
    }

    /// 按页类别映射 `va`
    pub fn alloc_page(&mut self, va: VirtAddr, class: PageClass) -> Result<KernelAddr> {
        if class.is_untrusted() {
            let utm = self.utm.as_mut().ok_or(MemError::UtmNotInitialized)?;
            utm.alloc_page(&mut self.epm, va, class.flags())
        } else {
            self.epm.alloc_page(va, class.flags())
        }
    }

    /// 按 ioctl 中的页类别编号映射 `va`
    pub fn alloc_page_by_code(&mut self, va: VirtAddr, code: usize) -> Result<KernelAddr> {
        self.alloc_page(va, PageClass::try_from(code)?)
    }

    /// 预先建好 `[start, start + pages)` 的中间页表，返回完成的页数
    pub fn alloc_vspace(&mut self, start: VirtAddr, pages: usize) -> usize {
        self.epm.alloc_vspace(start, pages)
    }

    pub fn translate(&self, va: VirtAddr) -> Result<Option<PhysAddr>> {
        self.epm.translate(va)
    }

    /// EPM 中下一个空闲页的物理地址
    pub fn free_phys(&self) -> Option<PhysAddr> {
        self.epm.free_phys()
    }

    pub fn layout(&self) -> MemoryLayout {
        let paddr = |pa: Option<PhysAddr>| pa.map_or(0, usize::from);
        let utm = self.utm.as_ref();
        MemoryLayout {
            epm_paddr: paddr(self.epm.phys_base()),
            epm_size: self.epm.size(),
            utm_paddr: paddr(utm.and_then(|utm| utm.phys_base())),
            utm_size: utm.map_or(0, |utm| utm.size()),
            pt_ptr: paddr(self.epm.root_phys()),
            free_paddr: paddr(self.epm.free_phys()),
            utm_free_ptr: paddr(utm.and_then(|utm| utm.region().free_phys())),
        }
    }

    /// 归还 EPM 和 UTM
    pub fn destroy(&mut self) {
        if let Some(utm) = self.utm.as_mut() {
            utm.destroy();
        }
        self.epm.destroy();
    }
}

/// 以 eid 为键的 enclave 表
pub struct EnclaveTable<S: FrameSource> {
    enclaves: Mutex<BTreeMap<usize, (EidHandle, Arc<Mutex<EnclaveMemory<S>>>)>>,
}

impl<S: FrameSource> EnclaveTable<S> {
    pub fn new() -> Self {
        Self {
            enclaves: Mutex::new(BTreeMap::new()),
        }
    }

    /// 创建一个 enclave 并返回其 eid
    pub fn create(&self, source: Arc<S>, min_pages: usize) -> Result<usize> {
        let memory = EnclaveMemory::new(source, min_pages)?;
        let handle = eid_alloc();
        let eid = handle.eid();
        self.enclaves
            .lock()
            .insert(eid, (handle, Arc::new(Mutex::new(memory))));
        info!("创建 enclave {}", eid);
        Ok(eid)
    }

    /// 获取 enclave，调用者加锁后独占其内存
    pub fn get(&self, eid: usize) -> Result<Arc<Mutex<EnclaveMemory<S>>>> {
        self.enclaves
            .lock()
            .get(&eid)
            .map(|(_, memory)| memory.clone())
            .ok_or(MemError::NoSuchEnclave(eid))
    }

    /// 从表中移除并归还内存，eid 随之回收
    pub fn destroy(&self, eid: usize) -> Result<()> {
        let (handle, memory) = self
            .enclaves
            .lock()
            .remove(&eid)
            .ok_or(MemError::NoSuchEnclave(eid))?;
        // 其他持有者之后的操作会得到 NotInitialized
        memory.lock().destroy();
        drop(handle);
        info!("销毁 enclave {}", eid);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.enclaves.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.enclaves.lock().is_empty()
    }
}

impl<S: FrameSource> Default for EnclaveTable<S> {
    fn default() -> Self {
        Self::new()
    }
}
