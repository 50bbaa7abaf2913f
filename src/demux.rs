//! The channel-demux framing state machine (§4.5), as a pure function over
//! a growable buffer.
//!
//! Splitting the byte-level parsing out of [`crate::session::Session`]
//! means the framing algorithm — the part §8 actually wants exercised with
//! arbitrary byte splits (R1, B1-B3) — can be driven directly in tests
//! without a live socket, child process, or event loop.

use crate::config::READY_SENTINEL;
use crate::error::Error;

/// What one call to [`parse_frame`] produced.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FrameOutcome {
    /// Fewer than 4 bytes, or a declared-length frame that isn't fully
    /// buffered yet. The buffer is left untouched; wait for more reads.
    NeedMore,
    /// The ready sentinel, alone, was observed and the buffer has been
    /// reset. Whether this is actually *valid* depends on the session's
    /// state (§4.5 step 5) — that check belongs to the caller.
    Sentinel,
    /// Exactly one frame's payload, and the buffer has been reset.
    Frame(Vec<u8>),
}

/// Attempt to parse one frame out of `buf`, per §4.5 steps 3-9.
///
/// `buf` must already contain whatever bytes were just read. `len` (the
/// decoded 4-byte prefix) is the *payload* length, not counting the prefix
/// itself (R1: "prepend it as 4-byte big-endian, hand `[prefix||L arbitrary
/// bytes]`"; E6 feeds `00 00 00 03` ahead of a 3-byte payload). On any
/// terminal outcome (`Sentinel`, `Frame`, or an `Err`) the buffer is reset
/// per step 9 (shrunk to zero capacity past 64KiB, else just cleared) before
/// returning, exactly as the source's `cleanup:` label does unconditionally.
pub(crate) fn parse_frame(buf: &mut Vec<u8>) -> Result<FrameOutcome, Error> {
    if buf.len() < 4 {
        return Ok(FrameOutcome::NeedMore);
    }

    let len = u32::from_be_bytes(buf[0..4].try_into().unwrap());

    if len == READY_SENTINEL {
        if buf.len() != 4 {
            let extra = buf.len();
            reset(buf);
            return Err(Error::framing(format!(
                "received ready sentinel, but {extra} bytes were buffered"
            )));
        }
        reset(buf);
        return Ok(FrameOutcome::Sentinel);
    }

    let len = len as usize;
    let buffered = buf.len() - 4;
    if buffered < len {
        return Ok(FrameOutcome::NeedMore);
    }
    if buffered > len {
        let total = buf.len();
        reset(buf);
        return Err(Error::framing(format!(
            "len = {len}, but {buffered} payload bytes were buffered ({total} total)"
        )));
    }

    let payload = buf[4..4 + len].to_vec();
    reset(buf);
    Ok(FrameOutcome::Frame(payload))
}

/// Resolves the source's `≤`-vs-`==` Open Question (SPEC_FULL.md §9):
/// only grow when the buffer is genuinely full, via a fallible reservation
/// so an allocation failure can be routed to the out-of-memory callback
/// instead of aborting unconditionally.
pub(crate) fn reserve_for_read(
    buf: &mut Vec<u8>,
    wanted: usize,
) -> Result<(), std::collections::TryReserveError> {
    if buf.len() == buf.capacity() {
        buf.try_reserve(wanted.max(4096))?;
    }
    Ok(())
}

/// Step 9: release the buffer entirely once it's grown past 64KiB, else
/// just clear it and keep the allocation around for the next frame.
fn reset(buf: &mut Vec<u8>) {
    if buf.capacity() > 65_536 {
        *buf = Vec::new();
    } else {
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_bytes_does_not_decode() {
        // B1
        let mut buf = vec![0, 0, 0];
        assert_eq!(parse_frame(&mut buf).unwrap(), FrameOutcome::NeedMore);
        assert_eq!(buf.len(), 3, "buffer must be untouched while waiting");
    }

    #[test]
    fn four_bytes_non_sentinel_waits() {
        // B2
        let mut buf = vec![0, 0, 0, 5];
        assert_eq!(parse_frame(&mut buf).unwrap(), FrameOutcome::NeedMore);
    }

    #[test]
    fn buffer_shrinks_past_64kib() {
        // B3
        let mut buf = Vec::new();
        buf.try_reserve(70_000).unwrap();
        assert!(buf.capacity() > 65_536);
        buf.extend_from_slice(&0xF5F55FF5u32.to_be_bytes());
        assert_eq!(parse_frame(&mut buf).unwrap(), FrameOutcome::Sentinel);
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn small_buffer_is_cleared_not_freed() {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&0xF5F55FF5u32.to_be_bytes());
        parse_frame(&mut buf).unwrap();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 128);
    }

    #[test]
    fn sentinel_alone_transitions() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xF5F55FF5u32.to_be_bytes());
        assert_eq!(parse_frame(&mut buf).unwrap(), FrameOutcome::Sentinel);
        assert!(buf.is_empty());
    }

    #[test]
    fn sentinel_with_trailing_bytes_is_framing_error() {
        // R2
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xF5F55FF5u32.to_be_bytes());
        buf.push(0xAA);
        assert!(parse_frame(&mut buf).is_err());
        assert!(buf.is_empty(), "buffer must still be reset on error");
    }

    #[test]
    fn straddling_frame_is_a_framing_error() {
        let mut buf = vec![0, 0, 0, 3, b'A', b'B', b'C', b'D'];
        assert!(parse_frame(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn one_complete_frame_round_trips() {
        // R1, E6
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"ABC");
        match parse_frame(&mut buf).unwrap() {
            FrameOutcome::Frame(payload) => assert_eq!(payload, b"ABC"),
            other => panic!("expected a frame, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_byte_splits_still_deliver_exactly_one_frame(payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..512)) {
            let len = (payload.len() as u32).to_be_bytes();
            let mut wire = Vec::new();
            wire.extend_from_slice(&len);
            wire.extend_from_slice(&payload);

            let mut buf = Vec::new();
            let mut delivered: Option<Vec<u8>> = None;
            for byte in wire {
                buf.push(byte);
                match parse_frame(&mut buf).unwrap() {
                    FrameOutcome::NeedMore => {}
                    FrameOutcome::Frame(p) => {
                        proptest::prop_assert!(delivered.is_none());
                        delivered = Some(p);
                    }
                    FrameOutcome::Sentinel => proptest::prop_assert!(false, "not a sentinel frame"),
                }
            }
            proptest::prop_assert_eq!(delivered, Some(payload));
            proptest::prop_assert!(buf.is_empty());
        }
    }
}
