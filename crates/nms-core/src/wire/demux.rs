//! Inbound demultiplexer.
//!
//! One buffer (a UDP datagram or a TCP chunk) may hold several frames from
//! either sub-protocol, possibly with junk in between. The demultiplexer
//! walks the buffer byte by byte until it sits on a magic byte, sizes the
//! candidate frame, checks its signature and only then decodes it. Anything
//! that fails is dropped and scanning resumes one byte further on.
//!
//! The signature is what separates a real frame start from a magic byte that
//! happens to appear inside ciphertext or noise.

use tracing::{debug, warn};

use crate::cursor::BinaryCursor;
use crate::error::{ProtocolError, Result};
use crate::wire::netflow::{self, NetflowFrame, NETFLOW_MAGIC};
use crate::wire::nettask::{self, NetTaskFrame, NETTASK_MAGIC};
use crate::wire::signature::FrameSigner;

/// A verified, decoded frame from either sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Netflow(NetflowFrame),
    NetTask(NetTaskFrame),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DemuxStats {
    /// Frames decoded and yielded.
    pub frames: usize,
    /// Bytes skipped while looking for a magic byte.
    pub skipped_bytes: usize,
    /// Magic bytes whose frame could not be sized (truncated, unknown type).
    pub unframed: usize,
    /// Sized candidates whose signature did not verify.
    pub signature_invalid: usize,
    /// Signed frames that still failed to decode.
    pub malformed: usize,
}

#[derive(Clone, Copy)]
enum Proto {
    Netflow,
    NetTask,
}

impl Proto {
    fn of(byte: u8) -> Option<Self> {
        match byte {
            NETFLOW_MAGIC => Some(Proto::Netflow),
            NETTASK_MAGIC => Some(Proto::NetTask),
            _ => None,
        }
    }

    fn frame_len(self, c: &BinaryCursor<'_>) -> Result<usize> {
        match self {
            Proto::Netflow => netflow::frame_len(c),
            Proto::NetTask => nettask::frame_len(c),
        }
    }

    fn decode(self, c: &mut BinaryCursor<'_>) -> Result<Frame> {
        match self {
            Proto::Netflow => netflow::decode(c).map(Frame::Netflow),
            Proto::NetTask => nettask::decode(c).map(Frame::NetTask),
        }
    }
}

/// Iterator over the verified frames of one inbound buffer.
pub struct Demux<'a, 's> {
    cursor: BinaryCursor<'a>,
    signer: &'s FrameSigner,
    stats: DemuxStats,
}

impl<'a, 's> Demux<'a, 's> {
    pub fn new(buf: &'a [u8], signer: &'s FrameSigner) -> Self {
        Self {
            cursor: BinaryCursor::new(buf),
            signer,
            stats: DemuxStats::default(),
        }
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// Step past the current byte after a rejected candidate.
    fn resync(&mut self) {
        // Only called while sitting on a magic byte, so this cannot fail.
        let _ = self.cursor.advance(1);
    }

    fn seek_magic(&mut self) -> Option<Proto> {
        loop {
            let b = self.cursor.peek()?;
            if let Some(p) = Proto::of(b) {
                return Some(p);
            }
            let _ = self.cursor.advance(1);
            self.stats.skipped_bytes += 1;
        }
    }
}

impl Iterator for Demux<'_, '_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            let proto = self.seek_magic()?;
            let offset = self.cursor.position();

            let len = match proto.frame_len(&self.cursor) {
                Ok(n) => n,
                Err(e) => {
                    debug!(offset, code = %e.code(), "candidate frame not sized: {e}");
                    self.stats.unframed += 1;
                    self.resync();
                    continue;
                }
            };

            let verified = self
                .cursor
                .peek_bytes(len)
                .map(|f| self.signer.verify_frame(f))
                .unwrap_or(false);
            if !verified {
                debug!(offset, len, code = %ProtocolError::SignatureInvalid.code(), "dropping candidate frame");
                self.stats.signature_invalid += 1;
                self.resync();
                continue;
            }

            match proto.decode(&mut self.cursor) {
                Ok(frame) => {
                    self.stats.frames += 1;
                    return Some(frame);
                }
                Err(e) => {
                    warn!(offset, len, code = %e.code(), "signed frame failed to decode: {e}");
                    self.stats.malformed += 1;
                    // Signed, so the extent is trustworthy: skip the whole frame.
                    if self.cursor.advance(len).is_err() {
                        self.resync();
                    }
                }
            }
        }
    }
}

/// Collect every verified frame of `buf`.
pub fn demux(buf: &[u8], signer: &FrameSigner) -> (Vec<Frame>, DemuxStats) {
    let mut it = Demux::new(buf, signer);
    let frames = it.by_ref().collect();
    (frames, it.stats())
}
