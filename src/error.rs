//! 内存引擎的错误类型
use crate::mm::PhysAddr;

/// 内存引擎返回的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemError {
    /// 无法获得后备内存，或空闲页链表已耗尽
    #[error("out of memory")]
    OutOfMemory,
    /// 区域尚未初始化或已被销毁
    #[error("region is not initialized")]
    NotInitialized,
    /// 参数无效（例如请求 0 页）
    #[error("invalid argument")]
    InvalidArgument,
    /// 中间页表项指向了 EPM 之外的物理页
    #[error("page table entry points outside the EPM: {0:?}")]
    CorruptTable(PhysAddr),
    /// 未知的页类别编号
    #[error("unknown page class {0}")]
    InvalidPageClass(usize),
    /// 尚未创建 UTM
    #[error("untrusted memory is not initialized")]
    UtmNotInitialized,
    /// UTM 已经创建
    #[error("untrusted memory is already initialized")]
    UtmAlreadyInitialized,
    /// 没有这个 enclave
    #[error("no enclave with id {0}")]
    NoSuchEnclave(usize),
}

/// 内存引擎的结果类型
pub type Result<T> = core::result::Result<T, MemError>;
