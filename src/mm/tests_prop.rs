#![cfg(test)]
//! 随机操作序列下的性质测试：
//! - EPM 的每一页恰好处于空闲、页表节点、EPM 数据页三者之一
//! - UTM 的每一页恰好处于空闲、共享数据页二者之一
//! - 映射后 translate 得到的正是分配返回的页
//! - 最终整块归还，分配与释放次数相等

use super::test_util::HostFrames;
use super::{Epm, KernelAddr, PageClass, Utm, VirtAddr, VirtPageNum};
use crate::config::PAGE_SIZE;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Alloc(usize, PageClass),
    Vspace(usize, usize),
}

fn arb_vpn() -> impl Strategy<Value = usize> {
    prop_oneof![0usize..2048, 0x7fc_0000usize..0x7fc_0100]
}

fn arb_class() -> impl Strategy<Value = PageClass> {
    (0usize..5).prop_map(|code| PageClass::try_from(code).unwrap())
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (arb_vpn(), arb_class()).prop_map(|(vpn, class)| Op::Alloc(vpn, class)),
        1 => (arb_vpn(), 1usize..1024).prop_map(|(vpn, n)| Op::Vspace(vpn, n)),
    ]
}

/// 检查两个区域中的页是否被完整且不重叠地划分
fn check_partition(epm: &Epm<HostFrames>, utm: &Utm<HostFrames>) -> Result<(), TestCaseError> {
    let mut epm_seen = BTreeSet::new();
    let mut utm_seen = BTreeSet::new();

    for page in epm.free_list().iter() {
        prop_assert!(epm.region().contains(page));
        prop_assert!(epm_seen.insert(page), "空闲页重复 {:?}", page);
    }
    for ppn in epm.table_pages().unwrap() {
        let page = epm.region().to_kernel(ppn.into());
        prop_assert!(page.is_some(), "页表节点不在 EPM 中");
        prop_assert!(epm_seen.insert(page.unwrap()), "页表节点与其他页重叠");
    }
    for page in utm.free_list().iter() {
        prop_assert!(utm.region().contains(page));
        prop_assert!(utm_seen.insert(page), "UTM 空闲页重复 {:?}", page);
    }
    for (_, pte) in epm.leaf_mappings().unwrap() {
        let pa = pte.ppn().into();
        if let Some(page) = epm.region().to_kernel(pa) {
            prop_assert!(epm_seen.insert(page), "EPM 数据页与其他页重叠");
        } else if let Some(page) = utm.region().to_kernel(pa) {
            prop_assert!(utm_seen.insert(page), "UTM 数据页与其他页重叠");
        } else {
            prop_assert!(false, "叶子页不属于任何区域");
        }
    }

    prop_assert_eq!(epm_seen.len(), epm.region().pages());
    prop_assert_eq!(utm_seen.len(), utm.region().pages());
    Ok(())
}

proptest! {
    #[test]
    fn pages_stay_partitioned(
        min_pages in 1usize..40,
        utm_pages in 1usize..8,
        ops in prop::collection::vec(arb_op(), 1..40),
    ) {
        let source = Arc::new(HostFrames::new(128));
        let mut epm = Epm::new(source.clone(), min_pages).unwrap();
        let mut utm = Utm::new(source.clone(), utm_pages * PAGE_SIZE).unwrap();
        let mut mapped: Vec<(VirtAddr, KernelAddr)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(vpn, class) => {
                    let va: VirtAddr = VirtPageNum(vpn).into();
                    let before = epm.free_list().len() + utm.free_list().len();
                    let result = if class.is_untrusted() {
                        utm.alloc_page(&mut epm, va, class.flags())
                    } else {
                        epm.alloc_page(va, class.flags())
                    };
                    if let Ok(page) = result {
                        let existing = mapped.iter().find(|(v, _)| *v == va).map(|(_, p)| *p);
                        match existing {
                            // 重复分配返回原来的页且不消耗空闲页
                            Some(old) => {
                                prop_assert_eq!(old, page);
                                prop_assert_eq!(before, epm.free_list().len() + utm.free_list().len());
                            }
                            None => mapped.push((va, page)),
                        }
                    }
                }
                Op::Vspace(vpn, n) => {
                    let done = epm.alloc_vspace(VirtPageNum(vpn).into(), n);
                    prop_assert!(done <= n);
                }
            }
            check_partition(&epm, &utm)?;
        }

        for (va, page) in &mapped {
            let pa = epm.region().to_phys(*page).or_else(|| utm.region().to_phys(*page));
            prop_assert_eq!(epm.translate(*va).unwrap(), pa);
        }

        drop(utm);
        drop(epm);
        prop_assert!(source.balanced());
    }

    #[test]
    fn init_order_is_ceil_log2(min_pages in 1usize..=64) {
        let source = Arc::new(HostFrames::new(64));
        let epm = Epm::new(source, min_pages).unwrap();
        let count = min_pages.next_power_of_two();
        prop_assert_eq!(epm.size(), count * PAGE_SIZE);
        prop_assert_eq!(1usize << epm.order(), count);
        prop_assert_eq!(epm.free_list().len(), count - 1);
    }
}
