//! Lower transport segment reassembly
//!
//! Segments of one message share a [`SessionKey`]. Each session collects
//! segments by byte offset and completes once they cover the whole upper
//! transport PDU, in whatever order they arrived.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use super::keys::NetKeyIvIndex;
use super::lower::{ACCESS_SEGMENT_SIZE, CONTROL_SEGMENT_SIZE};
use super::transport::DecryptedAccess;
use crate::error::DecodeError;

/// Identifies one segmented message: all of its segments share this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub src: u16,
    /// SeqZero normalized to the full 24-bit sequence number (SeqAuth)
    pub seq_auth: u32,
    pub iv_index: u32,
    pub net_key_iv_index: NetKeyIvIndex,
}

impl SessionKey {
    pub fn seq_zero(&self) -> u16 {
        (self.seq_auth & 0x1FFF) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduKind {
    Access,
    Control,
}

impl PduKind {
    pub fn unit_size(&self) -> usize {
        match self {
            PduKind::Access => ACCESS_SEGMENT_SIZE,
            PduKind::Control => CONTROL_SEGMENT_SIZE,
        }
    }
}

/// One received segment
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    pub kind: PduKind,
    pub seg_o: u8,
    pub seg_n: u8,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyStatus {
    Incomplete {
        /// Bit n set when segment n has been received
        received: u32,
        seg_n: u8,
        /// Known once the last segment has been seen
        total_len: Option<usize>,
    },
    Complete(Vec<u8>),
}

#[derive(Debug)]
struct Session {
    kind: PduKind,
    seg_n: u8,
    /// Segment data keyed by byte offset
    fragments: BTreeMap<usize, Vec<u8>>,
    total_len: Option<usize>,
    received: u32,
    duplicates: u32,
    completed: Option<Vec<u8>>,
    /// Decrypted upper transport PDU, once a key has opened it
    decrypted: Option<DecryptedAccess>,
}

impl Session {
    fn new(kind: PduKind, seg_n: u8) -> Self {
        Session {
            kind,
            seg_n,
            fragments: BTreeMap::new(),
            total_len: None,
            received: 0,
            duplicates: 0,
            completed: None,
            decrypted: None,
        }
    }

    fn insert(&mut self, fragment: &Fragment<'_>) {
        let unit = self.kind.unit_size();
        let offset = fragment.seg_o as usize * unit;

        if self.fragments.contains_key(&offset) {
            self.duplicates += 1;
            return;
        }

        self.fragments.insert(offset, fragment.data.to_vec());
        self.received |= 1u32 << fragment.seg_o;

        // The last segment is the only one that tells us the total length
        if fragment.seg_o == fragment.seg_n && self.total_len.is_none() {
            self.total_len = Some(fragment.seg_n as usize * unit + fragment.data.len());
        }
    }

    /// Concatenate fragments if they cover `[0, total_len)` without gaps.
    fn assemble(&self) -> Option<Vec<u8>> {
        let total = self.total_len?;
        let mut pdu = Vec::with_capacity(total);
        let mut covered = 0;

        for (&offset, data) in &self.fragments {
            if offset > covered {
                return None;
            }
            let end = (offset + data.len()).min(total);
            if end > covered {
                pdu.extend_from_slice(&data[covered - offset..end - offset]);
                covered = end;
            }
            if covered >= total {
                break;
            }
        }

        (covered == total).then_some(pdu)
    }

    fn status(&self) -> ReassemblyStatus {
        match &self.completed {
            Some(pdu) => ReassemblyStatus::Complete(pdu.clone()),
            None => ReassemblyStatus::Incomplete {
                received: self.received,
                seg_n: self.seg_n,
                total_len: self.total_len,
            },
        }
    }
}

/// Table of segmented messages being put back together.
///
/// Sessions are never evicted: a message either completes or stays
/// incomplete. Delivering a segment that was already seen changes nothing,
/// so replaying the same traffic yields the same results.
#[derive(Debug, Default)]
pub struct Reassembler {
    sessions: HashMap<SessionKey, Session>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a segment to its session and report where the session stands.
    pub fn push(
        &mut self,
        key: SessionKey,
        fragment: Fragment<'_>,
    ) -> Result<ReassemblyStatus, DecodeError> {
        let invalid = |reason| DecodeError::InvalidSegment {
            seg_o: fragment.seg_o,
            seg_n: fragment.seg_n,
            reason,
        };

        let unit = fragment.kind.unit_size();
        if fragment.seg_o > fragment.seg_n {
            return Err(invalid("SegO exceeds SegN"));
        }
        if fragment.data.is_empty() || fragment.data.len() > unit {
            return Err(invalid("segment length out of range"));
        }
        if fragment.seg_o < fragment.seg_n && fragment.data.len() != unit {
            return Err(invalid("short segment before the last one"));
        }

        let session = self
            .sessions
            .entry(key)
            .or_insert_with(|| Session::new(fragment.kind, fragment.seg_n));

        if session.kind != fragment.kind || session.seg_n != fragment.seg_n {
            return Err(invalid("segment does not match its session"));
        }

        if session.completed.is_some() {
            trace!(
                "Segment {}/{} for completed session 0x{:04x}/{}",
                fragment.seg_o,
                fragment.seg_n,
                key.src,
                key.seq_zero()
            );
            return Ok(session.status());
        }

        session.insert(&fragment);

        // Re-check on every insert: the total length may have just become known
        if let Some(pdu) = session.assemble() {
            debug!(
                "Reassembled {} bytes from 0x{:04x} (SeqZero {})",
                pdu.len(),
                key.src,
                key.seq_zero()
            );
            session.completed = Some(pdu);
        }

        Ok(session.status())
    }

    pub fn status(&self, key: &SessionKey) -> Option<ReassemblyStatus> {
        self.sessions.get(key).map(Session::status)
    }

    /// Segment numbers not yet received for an incomplete session
    pub fn missing_segments(&self, key: &SessionKey) -> Option<Vec<u8>> {
        let session = self.sessions.get(key)?;
        Some(
            (0..=session.seg_n)
                .filter(|&n| session.received & (1u32 << n) == 0)
                .collect(),
        )
    }

    /// How many already-seen segments were delivered again
    pub fn duplicates(&self, key: &SessionKey) -> u32 {
        self.sessions.get(key).map_or(0, |s| s.duplicates)
    }

    /// Sessions that have not completed, with the segment count received so far
    pub fn incomplete(&self) -> impl Iterator<Item = (&SessionKey, u32)> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.completed.is_none())
            .map(|(k, s)| (k, s.received.count_ones()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Decrypted message previously stored for a completed session
    pub fn cached_outcome(&self, key: &SessionKey) -> Option<&DecryptedAccess> {
        self.sessions.get(key)?.decrypted.as_ref()
    }

    /// Remember a successful decryption. Failures are not stored, so a key
    /// added later can still open the message.
    pub fn cache_outcome(&mut self, key: &SessionKey, decrypted: DecryptedAccess) {
        if let Some(session) = self.sessions.get_mut(key) {
            if session.completed.is_some() {
                session.decrypted = Some(decrypted);
            }
        }
    }

    /// Forget every decrypted result, keeping the segments.
    pub fn clear_outcomes(&mut self) {
        for session in self.sessions.values_mut() {
            session.decrypted = None;
        }
    }
}
