//! Property-based tests for the heap arena and the compiler.
//!
//! - Live allocations never overlap, whatever the allocate/free order
//! - Freed blocks are reused before the arena grows past what is live
//! - Compiling the same source twice gives identical bytes
//! - Compiled integer arithmetic matches wrapping i32 arithmetic

use cinder::runtime::heap::Heap;
use cinder::{EnvironmentState, Machine, compile_source};
use proptest::prelude::*;

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum HeapOp {
    Allocate(u32),
    /// Frees the live block at this position, modulo the live count.
    Free(usize),
}

fn arb_heap_op() -> impl Strategy<Value = HeapOp> {
    prop_oneof![
        3 => (1u32..24).prop_map(HeapOp::Allocate),
        2 => any::<usize>().prop_map(HeapOp::Free),
    ]
}

fn arb_small_int() -> impl Strategy<Value = i32> {
    -10_000i32..10_000i32
}

fn overlaps(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.0 + b.1 && b.0 < a.0 + a.1
}

// =============================================================================
// Allocator
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn live_blocks_never_alias(
        ops in prop::collection::vec(arb_heap_op(), 1..120),
        scan_limit in 1usize..8,
    ) {
        let mut heap = Heap::new(16, 1 << 20, scan_limit);
        let mut live: Vec<(u32, u32)> = Vec::new();

        for op in ops {
            match op {
                HeapOp::Allocate(length) => {
                    let index = heap.allocate(length).unwrap();
                    let block = (index, length);
                    prop_assert!((index + length) as usize <= heap.len());
                    for other in &live {
                        prop_assert!(
                            !overlaps(block, *other),
                            "{:?} overlaps live block {:?}",
                            block,
                            other
                        );
                    }
                    live.push(block);
                }
                HeapOp::Free(position) if !live.is_empty() => {
                    let (index, length) = live.swap_remove(position % live.len());
                    heap.deallocate(index, length).unwrap();
                }
                HeapOp::Free(_) => {}
            }
        }
    }

    #[test]
    fn freed_block_is_reused(length in 1u32..64, smaller in 1u32..64) {
        let smaller = smaller.min(length);
        let mut heap = Heap::new(16, 1 << 20, 16);
        let first = heap.allocate(length).unwrap();
        heap.deallocate(first, length).unwrap();
        let before = heap.len();
        let again = heap.allocate(smaller).unwrap();
        prop_assert_eq!(again, first);
        prop_assert_eq!(heap.len(), before);
    }
}

// =============================================================================
// Compiler
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn compilation_is_deterministic(a in arb_small_int(), b in arb_small_int()) {
        let source = format!(
            "var a = {}\nvar b = {}\nfunction Mix(Int x, Int y) returns Int\n    return x * 3 - y\nvar c = Mix(a, b)",
            a, b
        );
        let first = compile_source("prop", &source).unwrap().to_bytes().unwrap();
        let second = compile_source("prop", &source).unwrap().to_bytes().unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn arithmetic_matches_host(a in arb_small_int(), b in arb_small_int(), c in 1i32..1000) {
        let source = format!(
            "var a = {}\nvar b = {}\nvar c = {}\nvar r = (a * b - c) / c + a % c",
            a, b, c
        );
        let program = compile_source("prop", &source).unwrap();
        let mut machine = Machine::new(16);
        machine.boot(program).unwrap();
        prop_assert!(machine.run(EnvironmentState::default()).unwrap());

        let expected = a.wrapping_mul(b).wrapping_sub(c) / c + a % c;
        prop_assert_eq!(machine.stack()[3] as i32, expected);
    }
}
