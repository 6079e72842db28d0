// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[allow(clippy::panic)]
fn data(ring: &OutputRing, offset: u64) -> Vec<u8> {
    match ring.read_from(offset) {
        ReadFrom::Data(v) => v,
        ReadFrom::Truncated { start, dropped } => {
            panic!("unexpected truncation: start={start} dropped={dropped}")
        }
    }
}

#[test]
fn empty_read() {
    let ring = OutputRing::new(16);
    assert_eq!(data(&ring, 0), Vec::<u8>::new());
    assert_eq!(ring.oldest(), 0);
    assert_eq!(ring.end(), 0);
}

#[test]
fn sequential_appends() {
    let mut ring = OutputRing::new(16);
    ring.append(b"hello");
    ring.append(b" world");

    assert_eq!(data(&ring, 0), b"hello world".to_vec());
    assert_eq!(data(&ring, 5), b" world".to_vec());
    assert_eq!(ring.end(), 11);
}

#[test]
fn wrap_advances_oldest() {
    let mut ring = OutputRing::new(8);
    ring.append(b"abcdef");
    ring.append(b"ghij");

    // total=10, capacity=8: offsets 0 and 1 are gone.
    assert_eq!(ring.oldest(), 2);
    assert_eq!(
        ring.read_from(0),
        ReadFrom::Truncated { start: 2, dropped: 2 }
    );
    assert_eq!(data(&ring, 2), b"cdefghij".to_vec());
    assert_eq!(data(&ring, 6), b"ghij".to_vec());
}

#[test]
fn read_past_end_is_empty() {
    let mut ring = OutputRing::new(16);
    ring.append(b"abc");
    assert_eq!(data(&ring, 3), Vec::<u8>::new());
    assert_eq!(data(&ring, 9), Vec::<u8>::new());
}

#[test]
fn oversized_append_keeps_tail() {
    let mut ring = OutputRing::new(4);
    ring.append(b"abcdefgh");
    assert_eq!(ring.end(), 8);
    assert_eq!(ring.oldest(), 4);
    assert_eq!(data(&ring, 4), b"efgh".to_vec());
}

#[test]
fn tail_offset_counts_partial_line() {
    let mut ring = OutputRing::new(64);
    ring.append(b"a\nb\nc");

    assert_eq!(ring.tail_offset(1), 4); // "c"
    assert_eq!(ring.tail_offset(2), 2); // "b\nc"
    assert_eq!(ring.tail_offset(3), 0);
    assert_eq!(ring.tail_offset(9), 0);
}

#[test]
fn tail_offset_complete_lines() {
    let mut ring = OutputRing::new(64);
    ring.append(b"a\nb\n");

    assert_eq!(ring.tail_offset(1), 2); // "b\n"
    assert_eq!(ring.tail_offset(2), 0);
    assert_eq!(ring.tail_offset(0), 4);
}

#[test]
fn tail_offset_survives_wrap() {
    let mut ring = OutputRing::new(8);
    ring.append(b"one\ntwo\nthree\n");

    // total=14, oldest=6: only "o\nthree\n" retained.
    assert_eq!(ring.oldest(), 6);
    assert_eq!(ring.tail_offset(1), 8); // "three\n"
    assert_eq!(ring.tail_offset(2), 6); // clamped to oldest
}

#[test]
fn tail_offset_no_newlines() {
    let mut ring = OutputRing::new(64);
    ring.append(b"abc");
    assert_eq!(ring.tail_offset(1), 0);
    assert_eq!(ring.tail_offset(5), 0);
}
