// SPDX-License-Identifier: BSD-3-Clause

//! Buffers and the pool that recycles them.

use std::rc::Rc;

use crate::bug;
use crate::etable::Object;

/// A byte-addressable, cursor-based read/write window used for every argument, return value and
/// event payload that crosses a transport boundary.
///
/// A `Buffer` is deliberately *not* generic over a node type (see the crate root for why): it
/// carries its own `needs_swap` flag, copied in from the owning node at request time, so that
/// `put_*`/`get_*` can byte-swap without knowing anything else about the node that asked for it.
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
    payload_size: usize,
    needs_swap: bool,
    object: Option<Rc<Object>>,
    /// Out-of-band storage for buffers attached via [`Self::put_nested`]. The `b` format token is
    /// a *handle* (§4.2's "nested buffer handle"), fixed at 8 bytes on the wire regardless of the
    /// nested payload's size - the payload itself never gets inlined into `data`, so a buffer
    /// sized for `arg_len()`/`ret_len()` never has to grow to fit whatever a caller attaches here.
    nested: Vec<Option<Buffer>>,
}

impl Buffer {
    pub(crate) fn new(capacity: usize, needs_swap: bool) -> Self {
        Buffer { data: vec![0u8; capacity], pos: 0, payload_size: 0, needs_swap, object: None, nested: Vec::new() }
    }

    /// Total addressable capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far (for an outbound buffer) or the decoded payload length (for an
    /// inbound one).
    pub fn len(&self) -> usize {
        self.payload_size
    }

    pub fn is_empty(&self) -> bool {
        self.payload_size == 0
    }

    /// Reset the cursor to the start without discarding the payload, so a buffer can be read back
    /// after being written, or re-read by a second consumer.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// The object this buffer is bound to, if any. Set by the call engine on the way out, and by
    /// a transport on the way in (see [`crate::node::NodeContext::bind_object`]).
    pub fn object(&self) -> Option<&Rc<Object>> {
        self.object.as_ref()
    }

    pub fn bind_object(&mut self, object: Rc<Object>) {
        self.object = Some(object);
    }

    /// The raw bytes written/decoded so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.payload_size]
    }

    fn require(&self, width: usize) {
        if self.pos + width > self.data.len() {
            bug!("buffer", "overrun: cursor {} + width {} > capacity {}", self.pos, width, self.data.len());
        }
    }

    fn advance_write(&mut self, width: usize) {
        self.pos += width;
        if self.pos > self.payload_size {
            self.payload_size = self.pos;
        }
    }
}

macro_rules! int_accessors {
    ($put:ident, $get:ident, $ty:ty, $width:expr) => {
        impl Buffer {
            #[doc = concat!("Write a ", stringify!($ty), " at the cursor, advancing it by ", stringify!($width), ".")]
            pub fn $put(&mut self, value: $ty) -> &mut Self {
                self.require($width);
                let bytes = if self.needs_swap { value.swap_bytes().to_ne_bytes() } else { value.to_ne_bytes() };
                self.data[self.pos..self.pos + $width].copy_from_slice(&bytes);
                self.advance_write($width);
                self
            }

            #[doc = concat!("Read a ", stringify!($ty), " at the cursor, advancing it by ", stringify!($width), ".")]
            pub fn $get(&mut self) -> $ty {
                self.require($width);
                let mut bytes = [0u8; $width];
                bytes.copy_from_slice(&self.data[self.pos..self.pos + $width]);
                self.pos += $width;
                let value = <$ty>::from_ne_bytes(bytes);
                if self.needs_swap { value.swap_bytes() } else { value }
            }
        }
    };
}

int_accessors!(put_u8, get_u8, u8, 1);
int_accessors!(put_i8, get_i8, i8, 1);
int_accessors!(put_u16, get_u16, u16, 2);
int_accessors!(put_i16, get_i16, i16, 2);
int_accessors!(put_u32, get_u32, u32, 4);
int_accessors!(put_i32, get_i32, i32, 4);
int_accessors!(put_u64, get_u64, u64, 8);
int_accessors!(put_i64, get_i64, i64, 8);

impl Buffer {
    /// Write a fixed-size binary block (the `sN.`/`bN.` format token), zero-padding on the right
    /// if `data` is shorter than `n`.
    pub fn put_bin(&mut self, n: usize, data: &[u8]) -> &mut Self {
        if data.len() > n {
            bug!("buffer", "bin block overflow: {} bytes supplied for a {}-byte field", data.len(), n);
        }
        self.require(n);
        self.data[self.pos..self.pos + data.len()].copy_from_slice(data);
        for b in &mut self.data[self.pos + data.len()..self.pos + n] {
            *b = 0;
        }
        self.advance_write(n);
        self
    }

    /// Read a fixed-size binary block.
    pub fn get_bin(&mut self, n: usize) -> &[u8] {
        self.require(n);
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        slice
    }

    /// Write already-serialized bytes verbatim, advancing the cursor past them without any
    /// padding or width check beyond the usual overrun guard. Used by the format-driven call API
    /// (`start_call_raw`/`call_raw`) for dynamic/bridge callers that have already encoded their
    /// arguments against an object's parsed [`crate::format::Format`] themselves, rather than
    /// going through the typed [`crate::node::ArgWriter`] accessors.
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.require(bytes.len());
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.advance_write(bytes.len());
        self
    }

    /// Attach a nested buffer out-of-band and write an 8-byte opaque handle referencing it (the
    /// `b` format token), for transports that advertise `buffer_put`/`buffer_get`. The nested
    /// payload is never copied into `self`'s own storage - only the handle occupies wire space -
    /// so a buffer sized for an object's declared `arg_len`/`ret_len` (which counts a `b` field as
    /// exactly 8 bytes) never overruns regardless of how large the attached buffer is.
    pub fn put_nested(&mut self, nested: Buffer) -> &mut Self {
        let handle = self.nested.len() as u64;
        self.nested.push(Some(nested));
        self.put_u64(handle);
        self
    }

    /// Read a nested buffer previously written with [`put_nested`](Self::put_nested). Fatal if the
    /// handle is out of range or has already been consumed: both indicate a core/transport
    /// contract violation, not a condition a caller could recover from.
    pub fn get_nested(&mut self) -> Buffer {
        let handle = self.get_u64() as usize;
        match self.nested.get_mut(handle).and_then(Option::take) {
            Some(buf) => buf,
            None => bug!("buffer", "nested buffer handle {} has no attached payload", handle),
        }
    }
}

/// A single-size-class LIFO pool of [`Buffer`]s.
///
/// Real deployments run a node against one wire size almost exclusively, so a single size class
/// is enough to avoid most allocation traffic without the bookkeeping of a general allocator:
/// requests for a different size simply bypass the pool.
pub struct BufferPool {
    idle: Vec<Buffer>,
    size_class: Option<usize>,
    gc_threshold: usize,
}

impl BufferPool {
    pub fn new(gc_threshold: usize) -> Self {
        BufferPool { idle: Vec::new(), size_class: None, gc_threshold }
    }

    /// Take a buffer of at least `size` bytes from the pool, or allocate a fresh one.
    pub fn request(&mut self, size: usize, needs_swap: bool) -> Buffer {
        if self.size_class == Some(size) {
            if let Some(mut buf) = self.idle.pop() {
                buf.pos = 0;
                buf.payload_size = 0;
                buf.needs_swap = needs_swap;
                buf.object = None;
                buf.nested.clear();
                return buf;
            }
        }
        Buffer::new(size, needs_swap)
    }

    /// Return a buffer to the pool, subject to the GC threshold.
    pub fn release(&mut self, mut buf: Buffer) {
        buf.object = None;
        buf.nested.clear();
        let cap = buf.capacity();
        if self.size_class != Some(cap) {
            self.idle.clear();
            self.size_class = Some(cap);
        }
        if self.idle.len() < self.gc_threshold {
            self.idle.push(buf);
        }
    }

    /// Pre-populate the pool with `count` buffers of `size` bytes, avoiding allocation traffic on
    /// the first burst of calls.
    pub fn preheat(&mut self, size: usize, count: usize) {
        self.size_class = Some(size);
        for _ in self.idle.len()..count {
            self.idle.push(Buffer::new(size, false));
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_native_order() {
        let mut buf = Buffer::new(16, false);
        buf.put_u32(0xdead_beef).put_i16(-7);
        buf.rewind();
        assert_eq!(buf.get_u32(), 0xdead_beef);
        assert_eq!(buf.get_i16(), -7);
    }

    #[test]
    fn swaps_when_peer_order_differs() {
        let mut buf = Buffer::new(4, true);
        buf.put_u32(0x0102_0304);
        assert_eq!(buf.as_slice(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    #[should_panic(expected = "BUG")]
    fn overrun_is_fatal() {
        let mut buf = Buffer::new(1, false);
        buf.put_u32(1);
    }

    #[test]
    fn bin_block_zero_pads() {
        let mut buf = Buffer::new(8, false);
        buf.put_bin(8, b"hi");
        buf.rewind();
        assert_eq!(buf.get_bin(8), b"hi\0\0\0\0\0\0");
    }

    #[test]
    fn pool_recycles_matching_size_class() {
        let mut pool = BufferPool::new(4);
        let buf = pool.request(32, false);
        assert_eq!(pool.idle_count(), 0);
        pool.release(buf);
        assert_eq!(pool.idle_count(), 1);
        let reused = pool.request(32, false);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(reused.capacity(), 32);
    }

    #[test]
    fn pool_drops_above_gc_threshold() {
        let mut pool = BufferPool::new(1);
        pool.release(Buffer::new(8, false));
        pool.release(Buffer::new(8, false));
        assert_eq!(pool.idle_count(), 1);
    }
}
