//! Enclave 内存引擎
//!
//! 为 RISC-V 上的 enclave 管理后备物理内存：分配连续的 EPM 并在其中构建
//! enclave 私有页表，另外管理与宿主共享的 UTM。
//!
//! - [`mm`]：空闲页链表、物理区域、页表遍历与页分配策略
//! - [`enclave`]：按 enclave 组织的内存以及 enclave 表

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod config;
pub mod enclave;
pub mod error;
pub mod mm;

pub use error::{MemError, Result};
