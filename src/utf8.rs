//! Streaming UTF-8 validation for Text message bodies, which may arrive
//! split across an arbitrary number of fragments — a multibyte codepoint can
//! straddle a fragment boundary, so validation can't just call
//! `str::from_utf8` per fragment. This is Bjoern Hoehrmann's "Flexible and
//! Economical UTF-8 Decoder" DFA (9 states, 12 byte classes), reproduced
//! verbatim since it's the standard, well-tested table for exactly this
//! problem: http://bjoern.hoehrmann.de/utf-8/decoder/dfa/

const UTF8_ACCEPT: u8 = 0;
const UTF8_REJECT: u8 = 1;

#[rustfmt::skip]
const UTF8D: [u8; 364] = [
    // byte -> character class
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, 9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,
    7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7, 7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,
    8,8,2,2,2,2,2,2,2,2,2,2,2,2,2,2, 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
    10,3,3,3,3,3,3,3,3,3,3,3,3,4,3,3, 11,6,6,6,5,8,8,8,8,8,8,8,8,8,8,8,
    // state transitions, indexed as state + class
    0,12,24,36,60,96,84,12,12,12,48,72, 12,12,12,12,12,12,12,12,12,12,12,12,
    12, 0,12,12,12,12,12, 0,12, 0,12,12, 12,24,12,12,12,12,12,24,12,24,12,12,
    12,12,12,12,12,12,12,24,12,12,12,12, 12,24,12,12,12,12,12,12,12,24,12,12,
    12,12,12,12,12,12,12,36,12,36,12,12, 12,36,12,12,12,12,12,36,12,36,12,12,
    12,36,12,12,12,12,12,12,12,12,12,12,
];

/// Incremental decoder state for a single logical UTF-8 byte stream that may
/// be fed in arbitrarily-sized chunks.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Utf8Validator {
    state: u8,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self { state: UTF8_ACCEPT }
    }

    /// Feeds one byte through the DFA. Returns `false` the moment the stream
    /// is known to be invalid; once `false` is returned the validator must
    /// not be fed further bytes.
    pub fn push(&mut self, byte: u8) -> bool {
        let class = UTF8D[byte as usize];
        self.state = UTF8D[256 + self.state as usize + class as usize];
        self.state != UTF8_REJECT
    }

    /// Feeds a whole slice. Returns `false` as soon as a rejection occurs.
    pub fn push_slice(&mut self, bytes: &[u8]) -> bool {
        for &b in bytes {
            if !self.push(b) {
                return false;
            }
        }
        true
    }

    /// Whether the stream ended on a valid, complete codepoint boundary.
    /// Must be checked at message end: a truncated multibyte sequence
    /// leaves the state mid-decode, which is also invalid.
    pub fn is_finished_cleanly(&self) -> bool {
        self.state == UTF8_ACCEPT
    }
}

/// One-shot validation of a complete, non-streamed buffer (used for close
/// reason strings, which are never fragmented).
pub(crate) fn is_valid_utf8(bytes: &[u8]) -> bool {
    let mut validator = Utf8Validator::new();
    validator.push_slice(bytes) && validator.is_finished_cleanly()
}
