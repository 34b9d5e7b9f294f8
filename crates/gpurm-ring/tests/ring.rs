use gpurm_ring::{Ring, RingError, Span};
use proptest::prelude::*;

#[test]
fn write_past_end_wraps_to_start() {
    let mut ring = Ring::new(16_384).unwrap();
    ring.write(&vec![0xAAAA_AAAA; 15_360]).unwrap();
    assert_eq!(ring.write_offset(), 15_360);

    let span = ring.write(&vec![0x5555_5555; 2_048]).unwrap();
    assert_eq!(span, Span { start: 0, len: 2_048 });
    assert_eq!(ring.write_offset(), 2_048);
}

#[test]
fn write_advances_by_len_when_space_is_available() {
    let mut ring = Ring::new(64).unwrap();
    for len in [1usize, 7, 16, 3] {
        let before = ring.write_offset();
        assert!(ring.free_space() >= len);
        ring.write(&vec![1; len]).unwrap();
        assert_eq!(ring.write_offset(), (before + len) % ring.capacity());
        ring.set_read_offset(ring.write_offset()).unwrap();
    }
}

#[test]
fn oversized_and_empty_writes_are_rejected() {
    let mut ring = Ring::new(8).unwrap();
    assert_eq!(
        ring.write(&[0; 9]),
        Err(RingError::TooLarge {
            len: 9,
            capacity: 8
        })
    );
    assert_eq!(ring.write(&[]), Err(RingError::Empty));
    assert_eq!(ring.write_offset(), 0);
}

#[test]
fn full_capacity_write_lands_back_at_zero() {
    let mut ring = Ring::new(8).unwrap();
    let span = ring.write(&[7; 8]).unwrap();
    assert_eq!(span, Span { start: 0, len: 8 });
    assert_eq!(ring.write_offset(), 0);
}

#[test]
fn fences_are_pre_incremented_and_never_reused() {
    let mut ring = Ring::new(8).unwrap();
    assert_eq!(ring.alloc_fence(), 1);

    // A reserved fence stays consumed even when the write it was meant for fails.
    let fence = ring.alloc_fence();
    assert!(ring.write(&[0; 9]).is_err());
    assert_eq!(fence, 2);
    assert_eq!(ring.alloc_fence(), 3);
}

#[test]
fn reset_clears_offsets_fence_and_contents() {
    let mut ring = Ring::new(8).unwrap();
    let span = ring.write(&[1, 2, 3]).unwrap();
    ring.alloc_fence();
    ring.set_read_offset(2).unwrap();

    ring.reset();
    assert_eq!(ring.write_offset(), 0);
    assert_eq!(ring.read_offset(), 0);
    assert_eq!(ring.fence(), 0);
    assert_eq!(ring.words(span).unwrap(), &[0, 0, 0]);
}

#[derive(Debug, Clone)]
enum Op {
    Write(usize),
    Consume,
    ConsumeTo(usize),
}

fn op_strategy(capacity: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..=capacity).prop_map(Op::Write),
        Just(Op::Consume),
        (0..capacity).prop_map(Op::ConsumeTo),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn offsets_stay_in_range(
        (capacity, ops) in (1usize..64).prop_flat_map(|cap| {
            (Just(cap), prop::collection::vec(op_strategy(cap), 0..64))
        })
    ) {
        let mut ring = Ring::new(capacity).unwrap();
        let mut last_fence = 0;
        for op in ops {
            match op {
                Op::Write(len) => {
                    let span = ring.write(&vec![0xC0DE; len]).unwrap();
                    prop_assert!(span.end() <= capacity);
                    let fence = ring.alloc_fence();
                    prop_assert_eq!(fence, last_fence + 1);
                    last_fence = fence;
                }
                Op::Consume => ring.set_read_offset(ring.write_offset()).unwrap(),
                Op::ConsumeTo(offset) => ring.set_read_offset(offset).unwrap(),
            }
            prop_assert!(ring.write_offset() < capacity);
            prop_assert!(ring.read_offset() < capacity);
            prop_assert_eq!(ring.free_space() + ring.used(), capacity - 1);
        }
    }
}
