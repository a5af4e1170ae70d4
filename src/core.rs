//! The core types and functions shared by the connection, protocol and device layers
use kstring::KString;
use std::{
    fmt,
    time::Duration,
};

/// Number of bytes in one register word on the wire
pub const WORD_BYTES: usize = 4;

/// The key under which the connection manager pools transport sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    /// `host:port` of the server exposing the device
    pub server: KString,
    /// Address of the device in the server's namespace
    pub device: KString,
}

impl ConnectionId {
    #[must_use]
    pub fn new(server: &str, device: &str) -> Self {
        Self {
            server: KString::from_ref(server),
            device: KString::from_ref(device),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.device)
    }
}

/// A register on a bus node of one device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress {
    /// Name of the bus node carrying register traffic
    pub bus: KString,
    /// Numeric register id
    pub register: u32,
}

impl RegisterAddress {
    #[must_use]
    pub fn new(bus: &str, register: u32) -> Self {
        Self {
            bus: KString::from_ref(bus),
            register,
        }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:#04x}]", self.bus, self.register)
    }
}

/// Byte order of register words, which differs between device types
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    #[must_use]
    pub fn encode(self, word: u32) -> [u8; WORD_BYTES] {
        match self {
            Self::Little => word.to_le_bytes(),
            Self::Big => word.to_be_bytes(),
        }
    }

    /// Decodes a word, returning `None` unless exactly [`WORD_BYTES`] bytes are given
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> Option<u32> {
        let chunk: [u8; WORD_BYTES] = bytes.try_into().ok()?;
        Some(match self {
            Self::Little => u32::from_le_bytes(chunk),
            Self::Big => u32::from_be_bytes(chunk),
        })
    }
}

fn field_mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

/// Decodes `count` fields of `width` bits from consecutive status words, least significant field
/// of the first word first. Fields never straddle words.
#[must_use]
pub fn unpack_fields(words: &[u32], width: u32, count: usize) -> Vec<u32> {
    let width = width.clamp(1, 32);
    let per_word = (32 / width) as usize;
    let mask = field_mask(width);
    (0..count)
        .map(|field| {
            words.get(field / per_word).map_or(0, |word| {
                let shift = (field % per_word) as u32 * width;
                (word >> shift) & mask
            })
        })
        .collect()
}

/// The inverse of [`unpack_fields`]. Values wider than `width` are truncated.
#[must_use]
pub fn pack_fields(fields: &[u32], width: u32) -> Vec<u32> {
    let width = width.clamp(1, 32);
    let per_word = (32 / width) as usize;
    let mask = field_mask(width);
    fields
        .chunks(per_word)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0, |word, (i, field)| word | ((field & mask) << (i as u32 * width)))
        })
        .collect()
}

/// Upper median (element `len / 2` after sorting), or `None` for no samples
#[must_use]
pub fn median(samples: &[u32]) -> Option<u32> {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    sorted.get(sorted.len() / 2).copied()
}

/// Sleep for `duration`, returning immediately for a zero duration
pub fn snooze(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}
