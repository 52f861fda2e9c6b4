// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

use std::io::Write;

/// Maximum size of a single switch frame or PFChan frame this core will handle.
///
/// Chosen generously above any plausible MTU; anything larger is a malformed or
/// hostile frame and is rejected before it reaches a `Buffer`.
pub const MAX_FRAME_SIZE: usize = 4096;

const OVERFLOW_ERR_MSG: &str = "overflow";

/// A safe, bounds-checked, fixed-capacity I/O buffer with big-endian push/pop helpers.
///
/// Individual wire structures (switch frames, route headers, PFChan frames) are parsed
/// through `BufferReader` below and assembled into plain growable `Vec<u8>`s; a
/// `Buffer<MAX_FRAME_SIZE>` is the final gate a fully-assembled outbound frame passes
/// through (`switch_iface`, `inside_iface`) before it's handed to the switch interface,
/// so an oversized frame is rejected with an `Err` rather than forwarded.
pub struct Buffer<const L: usize> {
    len: usize,
    data: [u8; L],
}

impl<const L: usize> Default for Buffer<L> {
    #[inline(always)]
    fn default() -> Self {
        Self { len: 0, data: [0u8; L] }
    }
}

impl<const L: usize> Buffer<L> {
    #[inline(always)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(b: &[u8]) -> std::io::Result<Self> {
        let l = b.len();
        if l <= L {
            let mut tmp = Self::new();
            tmp.len = l;
            tmp.data[0..l].copy_from_slice(b);
            Ok(tmp)
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, OVERFLOW_ERR_MSG))
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[0..self.len]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append raw bytes, growing the logical length.
    pub fn push_bytes(&mut self, b: &[u8]) -> std::io::Result<()> {
        let end = self.len + b.len();
        if end > L {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, OVERFLOW_ERR_MSG));
        }
        self.data[self.len..end].copy_from_slice(b);
        self.len = end;
        Ok(())
    }

    #[inline(always)]
    pub fn push_u8(&mut self, v: u8) -> std::io::Result<()> {
        self.push_bytes(&[v])
    }

    #[inline(always)]
    pub fn push_u16_be(&mut self, v: u16) -> std::io::Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    #[inline(always)]
    pub fn push_u32_be(&mut self, v: u32) -> std::io::Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    #[inline(always)]
    pub fn push_u64_be(&mut self, v: u64) -> std::io::Result<()> {
        self.push_bytes(&v.to_be_bytes())
    }

    /// A cursor-based reader over the buffer's logical contents.
    pub fn reader(&self) -> BufferReader<'_> {
        BufferReader { data: &self.data[0..self.len], pos: 0 }
    }
}

impl<const L: usize> Write for Buffer<L> {
    #[inline(always)]
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.push_bytes(buf)?;
        Ok(buf.len())
    }

    #[inline(always)]
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Sequential big-endian reader over a byte slice, used to decode PFChan frames and
/// switch/route headers. Every read is bounds-checked against the slice length.
pub struct BufferReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> std::io::Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, OVERFLOW_ERR_MSG));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn take_array<const N: usize>(&mut self) -> std::io::Result<[u8; N]> {
        let s = self.take(N)?;
        let mut a = [0u8; N];
        a.copy_from_slice(s);
        Ok(a)
    }

    pub fn take_u8(&mut self) -> std::io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u16_be(&mut self) -> std::io::Result<u16> {
        Ok(u16::from_be_bytes(self.take_array::<2>()?))
    }

    pub fn take_u32_be(&mut self) -> std::io::Result<u32> {
        Ok(u32::from_be_bytes(self.take_array::<4>()?))
    }

    pub fn take_u64_be(&mut self) -> std::io::Result<u64> {
        Ok(u64::from_be_bytes(self.take_array::<8>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_roundtrip() {
        let mut b: Buffer<64> = Buffer::new();
        b.push_u32_be(0xdeadbeef).unwrap();
        b.push_u64_be(0x0102030405060708).unwrap();
        b.push_bytes(&[1, 2, 3]).unwrap();

        let mut r = b.reader();
        assert_eq!(r.take_u32_be().unwrap(), 0xdeadbeef);
        assert_eq!(r.take_u64_be().unwrap(), 0x0102030405060708);
        assert_eq!(r.take(3).unwrap(), &[1, 2, 3]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn overflow_is_an_error() {
        let mut b: Buffer<4> = Buffer::new();
        assert!(b.push_u64_be(1).is_err());
    }

    #[test]
    fn truncated_read_is_an_error() {
        let b: Buffer<8> = Buffer::from_bytes(&[0, 0]).unwrap();
        let mut r = b.reader();
        assert!(r.take_u32_be().is_err());
    }
}
