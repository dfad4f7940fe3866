//! Integration tests for the audio-fork-core buffers.
//!
//! These tests drive the outbound audio buffer and the inbound reassembly
//! buffer through the public API the way the bridge does: producer writes,
//! network drains, fragmented messages arriving in different splits.

use audio_fork_core::{
    AudioRingBuffer, AudioWriteOutcome, ConnectionConfig, FragmentOutcome, FrameBuffer,
    FrameLimits, InboundFragment, PayloadKind,
};

const TRANSCRIPT: &str =
    r#"{"type":"transcript","is_final":true,"alternatives":[{"text":"hello world","confidence":0.93}]}"#;

fn reassemble(fb: &mut FrameBuffer, fragments: Vec<InboundFragment>) -> Vec<FragmentOutcome> {
    fragments.into_iter().map(|f| fb.push(f)).collect()
}

#[test]
fn test_overrun_on_4096_buffer_with_16_byte_reserve() {
    // Arrange
    let mut buf = AudioRingBuffer::new(4096, 16).unwrap();
    assert_eq!(buf.space_available(), 4080);

    // Act: a 5000-byte write can never fit
    let outcome = buf.write(&vec![0u8; 5000]);

    // Assert: buffer reset to empty, overrun flagged for notification
    assert!(matches!(
        outcome,
        AudioWriteOutcome::Overrun {
            written: 0,
            notify: true,
            ..
        }
    ));
    assert_eq!(buf.cursor(), 16);
    assert_eq!(buf.space_available(), 4080);

    // Act: the emptied buffer accepts the next small write
    let next = buf.write(&[1u8; 100]);

    // Assert
    assert_eq!(next, AudioWriteOutcome::Written(100));
    assert_eq!(buf.space_available(), 4096 - 116);
    assert_eq!(buf.pending_len(), 100);
}

#[test]
fn test_producer_and_drain_interleave_without_loss() {
    // Arrange
    let mut buf = AudioRingBuffer::new(4096, 16).unwrap();
    let mut sent = Vec::new();

    // Act: 50 frames of 320 bytes, drained every third write
    for i in 0..50u8 {
        let outcome = buf.write(&[i; 320]);
        assert_eq!(outcome, AudioWriteOutcome::Written(320));
        if i % 3 == 2 {
            sent.extend(buf.take_pending().unwrap());
        }
    }
    sent.extend(buf.take_pending().unwrap_or_default());

    // Assert: every byte arrives in order
    let expected: Vec<u8> = (0..50u8).flat_map(|i| [i; 320]).collect();
    assert_eq!(sent, expected);
}

#[test]
fn test_reassembly_is_identical_for_1_2_and_10_fragments() {
    for parts in [1usize, 2, 10] {
        // Arrange
        let mut fb = FrameBuffer::default();
        let fragments = InboundFragment::split(PayloadKind::Text, TRANSCRIPT.as_bytes(), parts);

        // Act
        let outcomes = reassemble(&mut fb, fragments);

        // Assert: only the last fragment completes, with the whole message
        let (last, rest) = outcomes.split_last().unwrap();
        assert!(rest.iter().all(|o| *o == FragmentOutcome::Incomplete), "parts={parts}");
        match last {
            FragmentOutcome::Complete(msg) => {
                assert_eq!(msg.payload, TRANSCRIPT.as_bytes(), "parts={parts}");
                assert_eq!(msg.kind, PayloadKind::Text);
            }
            other => panic!("parts={parts}: unexpected outcome {other:?}"),
        }
    }
}

#[test]
fn test_oversized_message_is_dropped_and_next_message_is_delivered() {
    // Arrange: the cap comes from the connection config
    let config = ConnectionConfig::new("call-1", "localhost", 8080, "/").with_max_message_size(1024);
    let mut fb = FrameBuffer::new(config.frame_limits());

    // Act: 4 KiB message in 8 fragments, then a small one
    let big = reassemble(
        &mut fb,
        InboundFragment::split(PayloadKind::Text, &[b'x'; 4096], 8),
    );
    let small = fb.push(InboundFragment::text("{\"ok\":true}"));

    // Assert
    assert_eq!(
        big.iter()
            .filter(|o| matches!(o, FragmentOutcome::Oversized { .. }))
            .count(),
        1
    );
    assert!(!big.iter().any(|o| matches!(o, FragmentOutcome::Complete(_))));
    match small {
        FragmentOutcome::Complete(msg) => assert_eq!(msg.payload, b"{\"ok\":true}"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_capacity_always_covers_received_while_assembling() {
    let mut fb = FrameBuffer::new(FrameLimits {
        max_message_size: 10_000,
        growth_increment: 256,
    });
    let payload = vec![1u8; 9_000];

    for fragment in InboundFragment::split(PayloadKind::Binary, &payload, 37)
        .into_iter()
        .map(|mut f| {
            // Senders do not always announce the remaining size
            f.remaining = 0;
            f
        })
    {
        let done = fragment.is_final;
        fb.push(fragment);
        if !done {
            assert!(fb.capacity() >= fb.received());
            assert!(fb.capacity() <= 10_000);
        }
    }
    assert!(!fb.is_assembling());
}
