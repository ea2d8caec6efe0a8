//! Cpumask algebra properties

use std::collections::HashSet;

use exo_sched_ext::scheduler::core::AtomicCpuMask;
use exo_sched_ext::CpuMask;
use proptest::prelude::*;

const NR: u32 = 130;

fn mask() -> impl Strategy<Value = CpuMask> {
    proptest::collection::vec(0..NR, 0..40).prop_map(|cpus| CpuMask::from_cpus(NR, cpus))
}

proptest! {
    #[test]
    fn prop_absorption(a in mask(), b in mask()) {
        prop_assert!(a.or(&a.andnot(&b)).equal(&a));
        prop_assert!(a.and(&a.or(&b)).equal(&a));
    }

    #[test]
    fn prop_de_morgan(a in mask(), b in mask()) {
        prop_assert!(a.or(&b).complement().equal(&a.complement().and(&b.complement())));
    }

    #[test]
    fn prop_weight_of_disjoint_parts(a in mask(), b in mask()) {
        let only_a = a.andnot(&b);
        let both = a.and(&b);
        prop_assert!(!only_a.intersects(&both));
        prop_assert_eq!(only_a.weight() + both.weight(), a.weight());
        prop_assert!(both.subset(&a) && both.subset(&b));
    }

    #[test]
    fn prop_iter_matches_test(a in mask()) {
        let set: Vec<u32> = a.iter().collect();
        prop_assert_eq!(set.len() as u32, a.weight());
        for cpu in 0..NR {
            prop_assert_eq!(a.test_cpu(cpu), set.contains(&cpu));
        }
        prop_assert_eq!(a.first(), set.first().copied());
    }

    #[test]
    fn prop_atomic_test_and_set(cpus in proptest::collection::vec(0..NR, 1..20)) {
        let m = AtomicCpuMask::new(NR);
        let mut seen = HashSet::new();
        for cpu in cpus {
            prop_assert_eq!(m.test_and_set_cpu(cpu), !seen.insert(cpu));
            prop_assert!(m.test_cpu(cpu));
        }
        prop_assert_eq!(m.load().weight() as usize, seen.len());
    }
}

#[test]
fn test_any_distribute_rotates() {
    let m = CpuMask::from_cpus(NR, [3, 64, 100]);
    let seen: HashSet<u32> = (0..6).filter_map(|_| m.any_distribute()).collect();
    assert!(seen.len() > 1);
    assert!(seen.iter().all(|&c| m.test_cpu(c)));
    assert_eq!(CpuMask::new(NR).any_distribute(), None);
}

#[test]
fn test_out_of_range_cpus_ignored() {
    let mut m = CpuMask::new(8);
    m.set_cpu(8);
    m.set_cpu(600);
    assert!(m.empty());
    assert!(!m.test_cpu(600));
    assert!(CpuMask::all(8).full());
    assert_eq!(CpuMask::from_hex("0x5", 8).map(|m| m.iter().collect::<Vec<_>>()), Ok(vec![0, 2]));
}
