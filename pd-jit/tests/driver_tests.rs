mod common;

use common::*;
use jit::CALLBACK_RETURN;
use proptest::prelude::*;

fn translate(
    buffer: &mut CodeBuffer,
    table: &mut SegmentTable,
    policy: BoundaryPolicy,
    source: &impl BytecodeSource,
    encoder: &mut FixedWidth,
    start: usize,
) -> JitResult<jit::SegmentId> {
    TranslationDriver::new(buffer, table, policy).translate(source, encoder, start)
}

#[test]
fn exhausted_buffer_keeps_earlier_segments() {
    let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
    let mut table = SegmentTable::new();
    let mut encoder = FixedWidth::new(1024);
    // [0, 3) needs 3 KiB, [3, 8) needs 5 KiB.
    let source = Bytes(vec![1, 1, BRANCH, 1, 1, 1, 1, BRANCH]);

    let first = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, 0)
        .expect("first range fits");
    let cursor = buffer.cursor();
    assert_eq!(cursor, 3 * 1024 + 1);

    let err = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, 3)
        .expect_err("second range does not fit");
    assert!(matches!(err, JitError::BufferExhausted { .. }));
    assert!(err.is_recoverable());
    assert_eq!(buffer.cursor(), cursor);
    assert_eq!(table.len(), 1);
    assert!(table.lookup(3).is_none());

    for pc in 0..3 {
        assert_eq!(table.lookup(pc).map(|s| s.id), Some(first));
    }
    let segment = table.get(first).expect("segment");
    assert!(buffer.is_executable(segment.code.clone()));
    assert_eq!(segment.entry.as_ptr(), buffer.base());
}

#[test]
fn segment_includes_terminal_instruction() {
    let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
    let mut table = SegmentTable::new();
    let source = Bytes(vec![1, 2, BRANCH, 3, 4]);
    let id = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut FixedWidth::new(4), 0)
        .expect("translate");
    let segment = table.get(id).expect("segment");
    assert_eq!(segment.bytecode, 0..3);
    assert_eq!(segment.code_len(), 3 * 4 + 1);
}

#[test]
fn segment_stops_at_next_segment_start() {
    let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
    let mut table = SegmentTable::new();
    let source = Bytes(vec![1, 1, 1, 1, 1, BRANCH]);
    let mut encoder = FixedWidth::new(4);
    let tail = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, 3)
        .expect("tail");
    let head = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, 0)
        .expect("head");
    assert_eq!(table.get(tail).map(|s| s.bytecode.clone()), Some(3..6));
    assert_eq!(table.get(head).map(|s| s.bytecode.clone()), Some(0..3));
}

#[test]
fn callback_return_is_never_translated() {
    let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
    let mut table = SegmentTable::new();
    let source = Bytes(vec![1, CALLBACK_RETURN, 1, BRANCH]);
    let mut encoder = FixedWidth::new(4);

    let id = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, 0)
        .expect("translate");
    assert_eq!(table.get(id).map(|s| s.bytecode.clone()), Some(0..1));

    let cursor = buffer.cursor();
    assert_eq!(
        translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, 1),
        Err(JitError::Declined {
            pc: 1,
            reason: DeclineReason::EmptyRange
        })
    );
    assert_eq!(buffer.cursor(), cursor);
    assert!(table.lookup(1).is_none());
}

#[test]
fn instruction_and_byte_limits_end_segments() {
    let source = Bytes(vec![1; 16]);
    let mut encoder = FixedWidth::new(8);

    let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
    let mut table = SegmentTable::new();
    let by_count = BoundaryPolicy {
        max_instructions: 5,
        max_code_bytes: 4096,
    };
    let id = translate(&mut buffer, &mut table, by_count, &source, &mut encoder, 0).expect("translate");
    assert_eq!(table.get(id).map(|s| s.bytecode.clone()), Some(0..5));

    let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
    let mut table = SegmentTable::new();
    let by_bytes = BoundaryPolicy {
        max_instructions: 256,
        max_code_bytes: 20,
    };
    let id = translate(&mut buffer, &mut table, by_bytes, &source, &mut encoder, 0).expect("translate");
    assert_eq!(table.get(id).map(|s| s.bytecode.clone()), Some(0..3));

    // A single oversized instruction still makes a segment.
    let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
    let mut table = SegmentTable::new();
    let tiny = BoundaryPolicy {
        max_instructions: 256,
        max_code_bytes: 1,
    };
    let id = translate(&mut buffer, &mut table, tiny, &source, &mut encoder, 0).expect("translate");
    assert_eq!(table.get(id).map(|s| s.bytecode.clone()), Some(0..1));
}

#[test]
fn translating_inside_a_segment_is_declined() {
    let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
    let mut table = SegmentTable::new();
    let source = Bytes(vec![1, 1, 1, BRANCH]);
    let mut encoder = FixedWidth::new(4);
    let id = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, 0)
        .expect("translate");
    assert_eq!(
        translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, 0),
        Ok(id)
    );
    assert!(matches!(
        translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, 2),
        Err(JitError::Declined {
            reason: DeclineReason::InsideSegment,
            ..
        })
    ));
    assert_eq!(table.len(), 1);
}

#[test]
fn sources_at_different_addresses_keep_separate_segments() {
    let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
    let mut table = SegmentTable::new();
    let mut encoder = FixedWidth::new(4);
    let short = Placed {
        base: 0,
        bytes: Bytes(vec![1, BRANCH]),
    };
    let long = Placed {
        base: 100,
        bytes: Bytes(vec![1, 1, 1, BRANCH]),
    };

    let first = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &short, &mut encoder, 0)
        .expect("short");
    let second = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &long, &mut encoder, 0)
        .expect("long");
    assert_ne!(first, second);
    assert_eq!(table.get(first).map(|s| s.bytecode.clone()), Some(0..2));
    assert_eq!(table.get(second).map(|s| s.bytecode.clone()), Some(100..104));
    assert_eq!(table.lookup(102).map(|s| s.id), Some(second));
    assert!(table.lookup(2).is_none());

    // pc 2 of the long source sits inside its own segment, not past the short one.
    assert!(matches!(
        translate(&mut buffer, &mut table, BoundaryPolicy::default(), &long, &mut encoder, 2),
        Err(JitError::Declined {
            pc: 2,
            reason: DeclineReason::InsideSegment
        })
    ));
}

proptest! {
    /// A translation that fails part way leaves the cursor and the table as they were.
    #[test]
    fn failed_translation_rolls_back(
        prefix in 0usize..12,
        width in 1usize..64,
        committed in 0usize..3,
    ) {
        let mut buffer = CodeBuffer::reserve(64 * 1024).expect("reserve");
        let mut table = SegmentTable::new();
        let mut encoder = FixedWidth::new(width);

        // Some committed segments first, each ending in a branch.
        let mut code = Vec::new();
        for _ in 0..committed {
            code.extend_from_slice(&[1, 1, BRANCH]);
        }
        let failing_start = code.len();
        code.extend(std::iter::repeat_n(1u8, prefix));
        code.push(UNENCODABLE);
        code.push(BRANCH);
        let source = Bytes(code);
        for segment in 0..committed {
            translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, segment * 3)
                .expect("committed segment");
        }

        let cursor = buffer.cursor();
        let err = translate(&mut buffer, &mut table, BoundaryPolicy::default(), &source, &mut encoder, failing_start)
            .expect_err("encoder refuses");
        let is_encoding_failure = matches!(err, JitError::EncodingFailure { .. });
        prop_assert!(is_encoding_failure, "unexpected error {}", err);
        prop_assert_eq!(buffer.cursor(), cursor);
        prop_assert_eq!(table.len(), committed);
        prop_assert!(table.lookup(failing_start).is_none());
        for segment in table.iter() {
            prop_assert!(buffer.is_executable(segment.code.clone()));
        }
    }
}
