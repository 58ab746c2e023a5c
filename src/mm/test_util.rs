//! 测试用的物理页来源：用宿主机堆内存模拟一段线性映射的物理内存，
//! 并记录每一次分配与归还。
use super::{BuddyFrameSource, FrameSource, KernelAddr, PhysAddr, PhysPageNum};
use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS};
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// 一致性内存的“物理地址”与内核地址不同，用来确认引擎不依赖线性映射
const COHERENT_PHYS_SHIFT: usize = 1 << 52;

#[derive(Default)]
struct Ledger {
    /// 内核地址 -> 页数
    outstanding: BTreeMap<usize, usize>,
    coherent: BTreeMap<usize, (Layout, PhysAddr)>,
    allocs: usize,
    frees: usize,
}

pub(crate) struct HostFrames {
    arena: usize,
    layout: Layout,
    buddy: BuddyFrameSource,
    buddy_enabled: bool,
    coherent_enabled: bool,
    ledger: Mutex<Ledger>,
}

impl HostFrames {
    /// `pages` 必须是 2 的幂
    pub fn new(pages: usize) -> Self {
        assert!(pages.is_power_of_two());
        let layout = Layout::from_size_align(pages * PAGE_SIZE, pages * PAGE_SIZE).unwrap();
        let arena = unsafe { alloc_zeroed(layout) } as usize;
        assert_ne!(arena, 0);
        let start = PhysPageNum(arena >> PAGE_SIZE_BITS);
        let end = PhysPageNum(start.0 + pages);
        Self {
            arena,
            layout,
            buddy: BuddyFrameSource::new(start, end, 0),
            buddy_enabled: true,
            coherent_enabled: false,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// 伙伴分配器总是失败
    pub fn without_buddy(mut self) -> Self {
        self.buddy_enabled = false;
        self
    }

    pub fn with_coherent(mut self) -> Self {
        self.coherent_enabled = true;
        self
    }

    pub fn with_max_order(mut self, max_order: usize) -> Self {
        self.buddy.set_max_order(max_order);
        self
    }

    pub fn allocs(&self) -> usize {
        self.ledger.lock().allocs
    }

    pub fn frees(&self) -> usize {
        self.ledger.lock().frees
    }

    /// 分配与归还次数相等且没有未归还的块
    pub fn balanced(&self) -> bool {
        let ledger = self.ledger.lock();
        ledger.allocs == ledger.frees && ledger.outstanding.is_empty() && ledger.coherent.is_empty()
    }

    fn record_alloc(&self, addr: KernelAddr, pages: usize) {
        let mut ledger = self.ledger.lock();
        assert!(ledger.outstanding.insert(addr.0, pages).is_none());
        ledger.allocs += 1;
    }

    fn record_free(&self, addr: KernelAddr, pages: usize) {
        let mut ledger = self.ledger.lock();
        assert_eq!(
            ledger.outstanding.remove(&addr.0),
            Some(pages),
            "{:?} 被重复释放或大小不符",
            addr
        );
        ledger.frees += 1;
    }
}

impl FrameSource for HostFrames {
    fn max_order(&self) -> usize {
        self.buddy.max_order()
    }

    fn alloc_pages(&self, order: usize) -> Option<KernelAddr> {
        assert!(order <= self.max_order(), "order {} 超过分配器上限", order);
        if !self.buddy_enabled {
            return None;
        }
        let addr = self.buddy.alloc_pages(order)?;
        self.record_alloc(addr, 1 << order);
        Some(addr)
    }

    fn free_pages(&self, addr: KernelAddr, order: usize) {
        self.record_free(addr, 1 << order);
        self.buddy.free_pages(addr, order);
    }

    fn alloc_coherent(&self, bytes: usize) -> Option<(KernelAddr, PhysAddr)> {
        if !self.coherent_enabled {
            return None;
        }
        let layout = Layout::from_size_align(bytes, PAGE_SIZE).ok()?;
        let addr = KernelAddr(unsafe { alloc_zeroed(layout) } as usize);
        if addr.0 == 0 {
            return None;
        }
        let phys = PhysAddr(addr.0 + COHERENT_PHYS_SHIFT);
        self.record_alloc(addr, bytes / PAGE_SIZE);
        self.ledger.lock().coherent.insert(addr.0, (layout, phys));
        Some((addr, phys))
    }

    fn free_coherent(&self, addr: KernelAddr, bytes: usize, phys: PhysAddr) {
        self.record_free(addr, bytes / PAGE_SIZE);
        let (layout, recorded) = self
            .ledger
            .lock()
            .coherent
            .remove(&addr.0)
            .expect("未知的一致性内存");
        assert_eq!(recorded, phys);
        assert_eq!(layout.size(), bytes);
        unsafe { dealloc(addr.as_mut_ptr(), layout) };
    }

    fn kernel_to_phys(&self, addr: KernelAddr) -> PhysAddr {
        self.buddy.kernel_to_phys(addr)
    }

    fn phys_to_kernel(&self, pa: PhysAddr) -> KernelAddr {
        self.buddy.phys_to_kernel(pa)
    }
}

impl Drop for HostFrames {
    fn drop(&mut self) {
        let ledger = self.ledger.get_mut();
        for (addr, (layout, _)) in core::mem::take(&mut ledger.coherent) {
            unsafe { dealloc(addr as *mut u8, layout) };
        }
        unsafe { dealloc(self.arena as *mut u8, self.layout) };
    }
}

std::thread_local! {
    static WARNINGS: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

/// 按线程记录 warn 级别日志，测试并行运行时互不干扰
struct WarnCapture;

impl Log for WarnCapture {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if record.level() == Level::Warn {
            WARNINGS.with(|w| w.borrow_mut().push(record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static WARN_CAPTURE: WarnCapture = WarnCapture;

/// 运行 `f` 并返回其间当前线程产生的 warn 日志
pub(crate) fn capture_warnings<R>(f: impl FnOnce() -> R) -> (R, Vec<String>) {
    // 只有第一次安装会成功，之后的调用复用同一个 logger
    let _ = log::set_logger(&WARN_CAPTURE);
    log::set_max_level(LevelFilter::Trace);
    WARNINGS.with(|w| w.borrow_mut().clear());
    let result = f();
    (result, WARNINGS.with(|w| w.take()))
}
