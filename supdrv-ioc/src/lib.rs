//! Shared wire-format types for the supdrv ioctl and IDC interfaces.
//!
//! This crate is the single source of truth for the request encoding used
//! between ring-3 clients and the support driver core. Both the driver and
//! its test harnesses depend on this to avoid struct duplication.
//!
//! ## Command words
//!
//! A command is a bit-packed 32-bit word in the BSD ioctl convention:
//!
//! ```text
//! ┌───────────┬──────────────────┬────────────┬──────────────┐
//! │ dir (3 b) │ param len (13 b) │ group (8b) │ number (8 b) │
//! └───────────┴──────────────────┴────────────┴──────────────┘
//! ```
//!
//! ## Request header
//!
//! Every slow-path request starts with a fixed 16-byte little-endian header:
//!
//! ```text
//! ┌────────────────────┬─────────────┬──────────────┬────────────┐
//! │ magic+flags (4 B)  │ cb_in (4 B) │ cb_out (4 B) │  rc (4 B)  │
//! └────────────────────┴─────────────┴──────────────┴────────────┘
//! ```
//!
//! - **magic+flags**: low and high bytes must match [`REQ_MAGIC`] under
//!   [`REQ_MAGIC_MASK`]; the middle 16 bits carry capability flags.
//! - **cb_in / cb_out**: input and output sizes, both at least
//!   [`REQ_HDR_SIZE`]; the larger of the two is the transfer size.
//! - **rc**: status slot filled in by the handler.

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding or decoding wire structures.
#[derive(Debug)]
pub enum WireError {
    /// Buffer too short for the fixed request header.
    ShortHeader(usize),
    /// The magic bits of the header do not match [`REQ_MAGIC`].
    BadMagic(u32),
    /// A declared size violates a header invariant.
    BadSize { cb_in: u32, cb_out: u32 },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::ShortHeader(len) => {
                write!(f, "buffer of {} bytes is too short for a request header", len)
            }
            WireError::BadMagic(flags) => write!(f, "bad header magic: {:#010x}", flags),
            WireError::BadSize { cb_in, cb_out } => {
                write!(f, "bad header sizes: cb_in={:#x} cb_out={:#x}", cb_in, cb_out)
            }
        }
    }
}

impl std::error::Error for WireError {}

// ---------------------------------------------------------------------------
// Ioctl command words
// ---------------------------------------------------------------------------

/// Direction bits of a command word.
pub const IOC_VOID: u32 = 0x2000_0000;
/// Data flows out of the kernel (inline buffer).
pub const IOC_OUT: u32 = 0x4000_0000;
/// Data flows into the kernel (inline buffer).
pub const IOC_IN: u32 = 0x8000_0000;
/// Inline input and output.
pub const IOC_INOUT: u32 = IOC_IN | IOC_OUT;
/// Mask covering all direction bits.
pub const IOC_DIRMASK: u32 = 0xe000_0000;
/// Mask for the 13-bit inline parameter length.
pub const IOC_PARM_MASK: u32 = 0x1fff;

/// Command group used by all support-driver requests.
pub const IOC_GROUP: u8 = b'S';

/// First function number of the reserved fast-path range.
pub const FAST_FIRST_FN: u8 = 64;
/// Number of consecutive fast-path function numbers.
pub const FAST_COUNT: u32 = 32;

/// Builds an `IOC_INOUT` command word carrying `len` inline bytes.
pub const fn ioctl_inout(group: u8, number: u8, len: u32) -> u32 {
    IOC_INOUT | ((len & IOC_PARM_MASK) << 16) | ((group as u32) << 8) | number as u32
}

/// Builds an `IOC_VOID` command word (indirect or argument-less request).
pub const fn ioctl_void(group: u8, number: u8) -> u32 {
    IOC_VOID | ((group as u32) << 8) | number as u32
}

/// Extracts the direction bits of a command word.
pub const fn ioctl_dir(cmd: u32) -> u32 {
    cmd & IOC_DIRMASK
}

/// Extracts the group byte of a command word.
pub const fn ioctl_group(cmd: u32) -> u8 {
    ((cmd >> 8) & 0xff) as u8
}

/// Extracts the function number of a command word.
pub const fn ioctl_number(cmd: u32) -> u8 {
    (cmd & 0xff) as u8
}

/// Extracts the declared inline parameter length of a command word.
pub const fn ioctl_param_len(cmd: u32) -> u32 {
    (cmd >> 16) & IOC_PARM_MASK
}

/// Returns the index within the fast-path range if `cmd` is one of the 32
/// reserved fast codes, `None` otherwise.
pub fn fast_index(cmd: u32) -> Option<u32> {
    if ioctl_dir(cmd) != IOC_VOID || ioctl_group(cmd) != IOC_GROUP {
        return None;
    }
    let number = ioctl_number(cmd) as u32;
    let index = number.wrapping_sub(FAST_FIRST_FN as u32);
    if index < FAST_COUNT { Some(index) } else { None }
}

/// The fast-path command word for the given range index.
pub const fn fast_cmd(index: u8) -> u32 {
    ioctl_void(IOC_GROUP, FAST_FIRST_FN + index)
}

// ---------------------------------------------------------------------------
// Request header
// ---------------------------------------------------------------------------

/// Size of the fixed request header in bytes.
pub const REQ_HDR_SIZE: usize = 16;

/// Required magic bits of `magic_flags` (low byte and high byte).
pub const REQ_MAGIC: u32 = 0x4200_0042;
/// Mask selecting the magic bits within `magic_flags`.
pub const REQ_MAGIC_MASK: u32 = 0xff00_00ff;

/// Capability flag: the request carries extra input beyond the header.
pub const REQ_FLAGS_EXTRA_IN: u32 = 0x0000_0100;
/// Capability flag: the request expects extra output beyond the header.
pub const REQ_FLAGS_EXTRA_OUT: u32 = 0x0000_0200;

/// Upper bound on `max(cb_in, cb_out)` for unbuffered requests: 16 MiB.
pub const REQ_MAX_SIZE: u32 = 16 * 1024 * 1024;

/// Fixed prefix of every slow-path request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqHdr {
    /// Magic bits plus capability flags.
    pub magic_flags: u32,
    /// Size of the input, header included.
    pub cb_in: u32,
    /// Size of the expected output, header included.
    pub cb_out: u32,
    /// Status slot; written by the request handler.
    pub rc: i32,
}

impl ReqHdr {
    /// A header with valid magic, no capability flags, and the given sizes.
    pub fn new(cb_in: u32, cb_out: u32) -> Self {
        Self { magic_flags: REQ_MAGIC, cb_in, cb_out, rc: 0 }
    }

    /// Whether the magic bits are intact.
    pub fn magic_ok(&self) -> bool {
        self.magic_flags & REQ_MAGIC_MASK == REQ_MAGIC
    }

    /// The transfer size: the larger of `cb_in` and `cb_out`.
    pub fn transfer_size(&self) -> u32 {
        self.cb_in.max(self.cb_out)
    }

    /// Decodes the header from the front of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < REQ_HDR_SIZE {
            return Err(WireError::ShortHeader(buf.len()));
        }
        let mut cur = Cursor::new(buf);
        // read_u32 on a 16+ byte slice cannot fail
        let magic_flags = cur.read_u32::<LittleEndian>().unwrap();
        let cb_in = cur.read_u32::<LittleEndian>().unwrap();
        let cb_out = cur.read_u32::<LittleEndian>().unwrap();
        let rc = cur.read_i32::<LittleEndian>().unwrap();
        Ok(Self { magic_flags, cb_in, cb_out, rc })
    }

    /// Encodes the header into the front of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < REQ_HDR_SIZE {
            return Err(WireError::ShortHeader(buf.len()));
        }
        let mut cur = Cursor::new(buf);
        cur.write_u32::<LittleEndian>(self.magic_flags).unwrap();
        cur.write_u32::<LittleEndian>(self.cb_in).unwrap();
        cur.write_u32::<LittleEndian>(self.cb_out).unwrap();
        cur.write_i32::<LittleEndian>(self.rc).unwrap();
        Ok(())
    }

    /// Serializes the header into a fresh 16-byte buffer.
    pub fn to_bytes(&self) -> [u8; REQ_HDR_SIZE] {
        let mut buf = [0u8; REQ_HDR_SIZE];
        self.write_to(&mut buf).unwrap();
        buf
    }

    /// Validates the invariants common to both slow-path variants: magic bits
    /// intact and both sizes at least the header size.
    pub fn validate(&self) -> Result<(), WireError> {
        if !self.magic_ok() {
            return Err(WireError::BadMagic(self.magic_flags));
        }
        if self.cb_in < REQ_HDR_SIZE as u32 || self.cb_out < REQ_HDR_SIZE as u32 {
            return Err(WireError::BadSize { cb_in: self.cb_in, cb_out: self.cb_out });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Well-known slow-path commands
// ---------------------------------------------------------------------------

/// Cookie negotiation, the first request on any fresh session.
pub const IOCTL_COOKIE: u32 = ioctl_inout(IOC_GROUP, 1, 32);
/// Open a loadable module image (indirect, variable size).
pub const IOCTL_LDR_OPEN: u32 = ioctl_void(IOC_GROUP, 5);
/// Push the ring-3 image bytes for the load parity check (indirect).
pub const IOCTL_LDR_LOAD: u32 = ioctl_void(IOC_GROUP, 6);
/// Unload a module image (indirect).
pub const IOCTL_LDR_FREE: u32 = ioctl_void(IOC_GROUP, 7);

/// Maximum length of a loadable module name, terminator excluded.
pub const LDR_NAME_MAX: usize = 32;

// ---------------------------------------------------------------------------
// IDC request codes
// ---------------------------------------------------------------------------

/// Establish a kernel-to-kernel connection; the only request accepted
/// without a session.
pub const IDC_REQ_CONNECT: u32 = 1;
/// Tear down a kernel-to-kernel connection.
pub const IDC_REQ_DISCONNECT: u32 = 2;
/// Resolve an exported or module symbol.
pub const IDC_REQ_GET_SYMBOL: u32 = 3;

/// Magic cookie carried by the connect request ("SUPD").
pub const IDC_CONNECT_COOKIE: u32 = 0x5355_5044;

/// IDC interface version, major in the high half.
pub const IDC_VERSION: u32 = 0x0001_0000;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_word_fields() {
        let cmd = ioctl_inout(IOC_GROUP, 9, 48);
        assert_eq!(ioctl_dir(cmd), IOC_INOUT);
        assert_eq!(ioctl_group(cmd), IOC_GROUP);
        assert_eq!(ioctl_number(cmd), 9);
        assert_eq!(ioctl_param_len(cmd), 48);

        let cmd = ioctl_void(IOC_GROUP, 5);
        assert_eq!(ioctl_dir(cmd), IOC_VOID);
        assert_eq!(ioctl_param_len(cmd), 0);
    }

    #[test]
    fn fast_range_membership() {
        assert_eq!(fast_index(fast_cmd(0)), Some(0));
        assert_eq!(fast_index(fast_cmd(31)), Some(31));
        // One past the range.
        assert_eq!(fast_index(ioctl_void(IOC_GROUP, FAST_FIRST_FN + 32)), None);
        // One before the range.
        assert_eq!(fast_index(ioctl_void(IOC_GROUP, FAST_FIRST_FN - 1)), None);
        // Right number, wrong direction bits.
        assert_eq!(fast_index(ioctl_inout(IOC_GROUP, FAST_FIRST_FN, 4)), None);
        // Right number, wrong group.
        assert_eq!(fast_index(ioctl_void(b'V', FAST_FIRST_FN)), None);
    }

    #[test]
    fn header_round_trip() {
        let hdr = ReqHdr::new(64, 32);
        let bytes = hdr.to_bytes();
        let decoded = ReqHdr::read_from(&bytes).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.transfer_size(), 64);
        decoded.validate().unwrap();
    }

    #[test]
    fn header_magic_must_match() {
        let mut hdr = ReqHdr::new(16, 16);
        hdr.validate().unwrap();

        // Capability flags in the middle bits do not disturb the magic.
        hdr.magic_flags |= REQ_FLAGS_EXTRA_IN | REQ_FLAGS_EXTRA_OUT;
        hdr.validate().unwrap();

        // Any flipped magic bit is a rejection.
        for bit in 0..32 {
            let mask = 1u32 << bit;
            if mask & REQ_MAGIC_MASK == 0 {
                continue;
            }
            let mut bad = ReqHdr::new(16, 16);
            bad.magic_flags ^= mask;
            assert!(matches!(bad.validate(), Err(WireError::BadMagic(_))), "bit {}", bit);
        }
    }

    #[test]
    fn header_sizes_must_cover_header() {
        let hdr = ReqHdr::new(REQ_HDR_SIZE as u32 - 1, 64);
        assert!(matches!(hdr.validate(), Err(WireError::BadSize { .. })));
        let hdr = ReqHdr::new(64, 0);
        assert!(matches!(hdr.validate(), Err(WireError::BadSize { .. })));
    }

    #[test]
    fn header_short_buffer() {
        assert!(matches!(ReqHdr::read_from(&[0u8; 15]), Err(WireError::ShortHeader(15))));
    }
}
