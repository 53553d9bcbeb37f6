//! Fragmentation and reassembly of frames over the BLE MTU.
//!
//! Wire format per fragment: a 4-byte header (`total_fragments` then
//! `fragment_index`, both u16 little-endian) followed by opaque payload.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::types::{Frame, PeerId};

use super::constants::{max_fragment_payload, FRAGMENT_HEADER_LEN};

/// Splits `frame` into fragments no larger than `max_fragment_payload(mtu)`
/// bytes of payload each, prefixed with the shared header.
pub fn fragment(frame: &[u8], mtu: u16) -> Result<Vec<Vec<u8>>> {
    let payload_cap = max_fragment_payload(mtu);
    if payload_cap == 0 {
        return Err(Error::Protocol(format!("MTU {mtu} leaves no room for payload")));
    }
    let total_fragments = frame.len().div_ceil(payload_cap).max(1);
    if total_fragments > u16::MAX as usize {
        return Err(Error::Protocol(format!(
            "frame of {} bytes needs {} fragments, more than u16::MAX",
            frame.len(),
            total_fragments
        )));
    }

    let mut out = Vec::with_capacity(total_fragments);
    for (index, chunk) in frame.chunks(payload_cap.max(1)).enumerate() {
        out.push(encode_fragment(total_fragments as u16, index as u16, chunk));
    }
    if out.is_empty() {
        // An empty frame is still one fragment with an empty payload.
        out.push(encode_fragment(1, 0, &[]));
    }
    Ok(out)
}

fn encode_fragment(total_fragments: u16, fragment_index: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAGMENT_HEADER_LEN + payload.len());
    buf.write_u16::<LittleEndian>(total_fragments).expect("vec write cannot fail");
    buf.write_u16::<LittleEndian>(fragment_index).expect("vec write cannot fail");
    buf.extend_from_slice(payload);
    buf
}

struct FragmentHeader {
    total_fragments: u16,
    fragment_index: u16,
}

fn decode_header(fragment: &[u8]) -> Result<(FragmentHeader, &[u8])> {
    if fragment.len() < FRAGMENT_HEADER_LEN {
        return Err(Error::Protocol(format!(
            "fragment header truncated: {} bytes",
            fragment.len()
        )));
    }
    let mut cursor = &fragment[..FRAGMENT_HEADER_LEN];
    let total_fragments = cursor.read_u16::<LittleEndian>().expect("length checked above");
    let fragment_index = cursor.read_u16::<LittleEndian>().expect("length checked above");
    Ok((
        FragmentHeader { total_fragments, fragment_index },
        &fragment[FRAGMENT_HEADER_LEN..],
    ))
}

struct ReassemblyBuffer {
    total_fragments: u16,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl ReassemblyBuffer {
    fn new(total_fragments: u16) -> Self {
        Self {
            total_fragments,
            parts: (0..total_fragments).map(|_| None).collect(),
            received: 0,
        }
    }

    fn insert(&mut self, fragment_index: u16, payload: &[u8]) {
        let slot = &mut self.parts[fragment_index as usize];
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(payload.to_vec());
    }

    fn is_complete(&self) -> bool {
        self.received == self.total_fragments as usize
    }

    fn concatenate(&self) -> Frame {
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(part.as_deref().unwrap_or_default());
        }
        out
    }
}

/// Per-remote-peripheral reassembly state. A buffer is created on fragment
/// index 0, appended on later indices, flushed when `received == total`,
/// and silently replaced (restart) if a new index 0 arrives mid-frame.
#[derive(Default)]
pub struct Reassembler {
    buffers: DashMap<PeerId, ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment from `peer`. Returns `Some(frame)` the instant a
    /// frame completes; returns `Ok(None)` while reassembly is in progress.
    /// Malformed fragments (truncated header, `fragment_index` out of
    /// range, or a `total_fragments` mismatch with the buffer in progress)
    /// are reported as a dropped reassembly: the buffer is discarded and
    /// `Ok(None)` is returned, matching the Protocol-error policy of
    /// silently dropping the frame rather than propagating upward.
    pub fn on_fragment(&self, peer: &PeerId, raw: &[u8]) -> Result<Option<Frame>> {
        let (header, payload) = decode_header(raw)?;

        if header.fragment_index == 0 {
            // New index-0 always restarts the buffer, even if one was
            // already in flight for this peer.
            self.buffers.insert(peer.clone(), ReassemblyBuffer::new(header.total_fragments));
        }

        let mut complete = None;
        if let Some(mut buffer) = self.buffers.get_mut(peer) {
            if header.fragment_index >= buffer.total_fragments
                || header.total_fragments != buffer.total_fragments
            {
                // Inconsistent with the buffer currently in progress: drop
                // silently per the Protocol error policy.
                drop(buffer);
                self.buffers.remove(peer);
                return Ok(None);
            }
            buffer.insert(header.fragment_index, payload);
            if buffer.is_complete() {
                complete = Some(buffer.concatenate());
            }
        }

        if complete.is_some() {
            self.buffers.remove(peer);
        }
        Ok(complete)
    }

    /// Drops any in-progress buffer for `peer`, e.g. on disconnect.
    pub fn evict(&self, peer: &PeerId) {
        self.buffers.remove(peer);
    }

    pub fn clear(&self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_count_matches_ceiling_division() {
        let frame = vec![7u8; 1000];
        let fragments = fragment(&frame, 185).unwrap();
        assert_eq!(fragments.len(), 6); // ceil(1000 / 181) = 6
        for (i, f) in fragments.iter().enumerate() {
            let (header, _) = decode_header(f).unwrap();
            assert_eq!(header.total_fragments, 6);
            assert_eq!(header.fragment_index, i as u16);
        }
    }

    #[test]
    fn fragmentation_then_reassembly_is_identity() {
        let frame = vec![42u8; 1000];
        let fragments = fragment(&frame, 185).unwrap();
        let reassembler = Reassembler::new();
        let peer = PeerId::from("peer-a");

        let mut out = None;
        for f in &fragments {
            out = reassembler.on_fragment(&peer, f).unwrap();
        }
        assert_eq!(out.unwrap(), frame);
    }

    #[test]
    fn reassembly_is_order_independent() {
        let frame: Vec<u8> = (0..500u16).map(|i| (i % 256) as u8).collect();
        let fragments = fragment(&frame, 185).unwrap();
        let mut shuffled = fragments.clone();
        shuffled.reverse();

        let reassembler = Reassembler::new();
        let peer = PeerId::from("peer-b");
        let mut out = None;
        for f in &shuffled {
            out = reassembler.on_fragment(&peer, f).unwrap();
        }
        assert_eq!(out.unwrap(), frame);
    }

    #[test]
    fn new_index_zero_restarts_the_buffer() {
        let frame_a = vec![1u8; 400];
        let frame_b = vec![2u8; 400];
        let fragments_a = fragment(&frame_a, 185).unwrap();
        let fragments_b = fragment(&frame_b, 185).unwrap();

        let reassembler = Reassembler::new();
        let peer = PeerId::from("peer-c");

        // Feed only the first fragment of A, then start B from scratch.
        reassembler.on_fragment(&peer, &fragments_a[0]).unwrap();

        let mut out = None;
        for f in &fragments_b {
            out = reassembler.on_fragment(&peer, f).unwrap();
        }
        assert_eq!(out.unwrap(), frame_b);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let reassembler = Reassembler::new();
        let peer = PeerId::from("peer-d");
        assert!(reassembler.on_fragment(&peer, &[1, 2]).is_err());
    }

    #[test]
    fn empty_frame_fragments_to_single_empty_payload_fragment() {
        let fragments = fragment(&[], 185).unwrap();
        assert_eq!(fragments.len(), 1);
        let reassembler = Reassembler::new();
        let peer = PeerId::from("peer-e");
        let out = reassembler.on_fragment(&peer, &fragments[0]).unwrap();
        assert_eq!(out.unwrap(), Vec::<u8>::new());
    }
}
