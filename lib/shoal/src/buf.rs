//! Chunked byte chain carrying one wire message. A chain is an ordered set
//! of fixed-size chunks; chunks can be stolen whole into another chain or
//! split at a byte boundary, which is what the fragmenter leans on to move
//! bulk values around without copying.
//!
//! Positions handed out to other modules (key positions, redirect address,
//! parse cursor) are stream offsets: every byte appended to a chain gets a
//! stable offset, recorded per chunk in `base`. Relocating bytes (repair,
//! stealing) preserves offsets, so a recorded position stays valid for as
//! long as the bytes themselves are in the chain.

use keel::shared::{ErrorType, NetError, NetResult};
use std::collections::VecDeque;
use std::io;

/// Data bytes per chunk.
pub const CHUNK_SIZE: usize = 16 * 1024;

pub struct Chunk {
    data: Box<[u8]>,
    /// Stream offset of `data[0]`.
    base: u64,
    /// Read cursor, `0 <= pos <= last`.
    pos: usize,
    /// Write cursor, `pos <= last <= data.len()`.
    last: usize,
}

impl Chunk {
    fn new(size: usize, base: u64) -> Chunk {
        Chunk {
            data: vec![0u8; size].into_boxed_slice(),
            base,
            pos: 0,
            last: 0,
        }
    }

    /// Readable bytes remaining in the chunk.
    #[inline]
    pub fn len(&self) -> usize {
        self.last - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == self.last
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.last == self.data.len()
    }

    #[inline]
    fn writable(&self) -> usize {
        self.data.len() - self.last
    }

    /// Stream offset of the first filled byte.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Stream offset one past the last filled byte.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.base + self.last as u64
    }

    /// All filled bytes, including ones already consumed by the read cursor.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.last]
    }

    /// Unconsumed bytes.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.pos..self.last]
    }

    fn write(&mut self, bytes: &[u8]) {
        self.data[self.last..self.last + bytes.len()].copy_from_slice(bytes);
        self.last += bytes.len();
    }
}

pub struct Chain {
    chunks: VecDeque<Chunk>,
    chunk_size: usize,
    /// Total readable bytes across all chunks.
    len: u64,
    /// Stream offset assigned to the next appended byte.
    wpos: u64,
}

impl Chain {
    #[inline]
    pub fn new() -> Chain {
        Chain::with_chunk_size(CHUNK_SIZE)
    }

    #[inline]
    pub fn with_chunk_size(chunk_size: usize) -> Chain {
        assert!(chunk_size >= 64, "chunk size too small to hold a message header");
        Chain {
            chunks: VecDeque::new(),
            chunk_size,
            len: 0,
            wpos: 0,
        }
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total readable length, the message's `mlen`.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn tail(&self) -> Option<&Chunk> {
        self.chunks.back()
    }

    /// Appends bytes at the tail. A slice no longer than the chunk size is
    /// kept contiguous in a single chunk; longer slices are split across
    /// chunks.
    pub fn append(&mut self, bytes: &[u8]) {
        let mut rest = bytes;

        while !rest.is_empty() {
            let take = rest.len().min(self.chunk_size);
            self.ensure(take);

            let chunk = self.chunks.back_mut().expect("ensure always leaves a tail");
            chunk.write(&rest[..take]);
            rest = &rest[take..];

            self.len += take as u64;
            self.wpos += take as u64;
        }
    }

    /// Guarantees the tail chunk has `n` contiguous writable bytes,
    /// `n <= chunk_size`.
    pub fn ensure(&mut self, n: usize) {
        assert!(n <= self.chunk_size);

        let need_fresh = match self.chunks.back() {
            Some(chunk) => chunk.writable() < n,
            None => true,
        };

        if need_fresh {
            let chunk = Chunk::new(self.chunk_size, self.wpos);
            self.chunks.push_back(chunk);
        }
    }

    /// Stream offset where the next appended byte will land.
    #[inline]
    pub fn write_offset(&self) -> u64 {
        self.wpos
    }

    /// Prepends a freshly formatted header in its own chunk. The header gets
    /// fresh stream offsets, so previously recorded positions are untouched.
    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.chunk_size);

        let mut chunk = Chunk::new(self.chunk_size, self.wpos);
        chunk.write(bytes);

        self.wpos += bytes.len() as u64;
        self.len += bytes.len() as u64;
        self.chunks.push_front(chunk);
    }

    /// Drops consumed chunks at the head.
    pub fn prune_empty_head(&mut self) {
        while matches!(self.chunks.front(), Some(chunk) if chunk.is_empty()) {
            self.chunks.pop_front();
        }
    }

    /// Advances the read cursor by `n` bytes from the head.
    pub fn consume(&mut self, mut n: u64) {
        assert!(n <= self.len);
        self.len -= n;

        while n > 0 {
            let chunk = self
                .chunks
                .front_mut()
                .expect("consume ran past the end of the chain");
            let take = (chunk.len() as u64).min(n);
            chunk.pos += take as usize;
            n -= take;

            if chunk.is_empty() && n > 0 {
                self.chunks.pop_front();
            }
        }
    }

    /// Resets every read cursor so the chain can be sent again verbatim.
    pub fn rewind_read(&mut self) {
        self.len = 0;
        for chunk in &mut self.chunks {
            chunk.pos = 0;
            self.len += chunk.last as u64;
        }
    }

    /// Empties the chain entirely.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Moves `n` readable bytes from the head of `src` into this chain,
    /// stealing whole chunks where possible and splitting on the boundary.
    pub fn transfer_from(&mut self, src: &mut Chain, mut n: u64) -> NetResult<()> {
        if n > src.len {
            return Err(NetError::Fatal(ErrorType::Protocol));
        }

        src.prune_empty_head();

        while n > 0 {
            let take_whole = match src.chunks.front() {
                Some(chunk) => chunk.len() as u64 <= n,
                None => return Err(NetError::Fatal(ErrorType::Protocol)),
            };

            if take_whole {
                let mut chunk = src.chunks.pop_front().expect("head checked above");
                let moved = chunk.len() as u64;

                chunk.base = self.wpos - chunk.pos as u64;
                self.wpos += moved;
                self.len += moved;
                self.chunks.push_back(chunk);

                src.len -= moved;
                n -= moved;
            } else {
                let chunk = src.chunks.front_mut().expect("head checked above");
                let split = n as usize;

                let bytes = chunk.data[chunk.pos..chunk.pos + split].to_vec();
                chunk.pos += split;
                src.len -= n;

                self.append(&bytes);
                n = 0;
            }
        }

        Ok(())
    }

    /// Drops `n` readable bytes from the head, chunk-granular where
    /// possible.
    pub fn discard(&mut self, n: u64) -> NetResult<()> {
        if n > self.len {
            return Err(NetError::Fatal(ErrorType::Protocol));
        }
        self.consume(n);
        self.prune_empty_head();
        Ok(())
    }

    /// Peeks the first unconsumed byte.
    pub fn first_byte(&self) -> Option<u8> {
        self.chunks
            .iter()
            .find(|chunk| !chunk.is_empty())
            .map(|chunk| chunk.data[chunk.pos])
    }

    /// Readable slice of the first non-empty chunk. Tokens are kept
    /// contiguous within a chunk, so protocol headers can be peeked here.
    pub fn head_readable(&self) -> &[u8] {
        self.chunks
            .iter()
            .find(|chunk| !chunk.is_empty())
            .map(|chunk| chunk.readable())
            .unwrap_or(&[])
    }

    /// Splits off every byte at stream offset `offset` and beyond, handing
    /// them back so they can seed the next pipelined message. Only valid on
    /// an inbound chain whose read cursors have not moved.
    pub fn take_tail_from(&mut self, offset: u64) -> Vec<u8> {
        debug_assert!(offset <= self.wpos);

        let mut parts: Vec<Vec<u8>> = Vec::new();
        while let Some(chunk) = self.chunks.back_mut() {
            if chunk.end_offset() <= offset {
                break;
            }

            let local = offset.saturating_sub(chunk.base) as usize;
            let moved = chunk.data[local..chunk.last].to_vec();

            self.len -= (chunk.last - local.max(chunk.pos)) as u64;
            chunk.last = local;
            chunk.pos = chunk.pos.min(local);
            parts.push(moved);

            if local == 0 {
                self.chunks.pop_back();
            } else {
                break;
            }
        }

        parts.into_iter().rev().flatten().collect()
    }

    /// Copies the bytes at stream offsets `[start, end)` out of the chain.
    pub fn copy_range(&self, start: u64, end: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity((end - start) as usize);

        for chunk in &self.chunks {
            let lo = start.max(chunk.base);
            let hi = end.min(chunk.end_offset());
            if lo < hi {
                let from = (lo - chunk.base) as usize;
                let to = (hi - chunk.base) as usize;
                out.extend_from_slice(&chunk.data[from..to]);
            }
        }

        debug_assert_eq!(out.len(), (end - start) as usize);
        out
    }

    /// All readable bytes, concatenated.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.readable());
        }
        out
    }

    /// Moves the partial token `[from, tail end)` into a fresh chunk so the
    /// parser can resume against contiguous bytes. The bytes keep their
    /// stream offsets.
    pub fn repair(&mut self, from: u64) {
        let tail = self.chunks.back_mut().expect("repair on an empty chain");
        let local = (from - tail.base) as usize;
        assert!(local <= tail.last && tail.pos <= local);

        let moved = tail.data[local..tail.last].to_vec();
        tail.last = local;

        let mut fresh = Chunk::new(self.chunk_size, from);
        fresh.write(&moved);
        self.chunks.push_back(fresh);
    }

    /// Reads once from `reader` into the tail chunk, growing the chain when
    /// the tail is full. `Ok(0)` means the peer closed.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.ensure(1);

        let chunk = self.chunks.back_mut().expect("ensure always leaves a tail");
        let count = reader.read(&mut chunk.data[chunk.last..])?;
        chunk.last += count;

        self.len += count as u64;
        self.wpos += count as u64;
        Ok(count)
    }

    /// Writes readable bytes to `writer`, advancing read cursors. Chunks are
    /// retained so the chain can be rewound and re-sent.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut sent = 0;

        for chunk in &mut self.chunks {
            while !chunk.is_empty() {
                let count = writer.write(&chunk.data[chunk.pos..chunk.last])?;
                if count == 0 {
                    return Err(io::ErrorKind::WriteZero.into());
                }
                chunk.pos += count;
                self.len -= count as u64;
                sent += count;
            }
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    #[test]
    fn test_append_and_offsets() {
        let mut chain = Chain::with_chunk_size(64);

        chain.append(b"hello");
        chain.append(b" world");

        assert_eq!(chain.len(), 11);
        assert_eq!(chain.write_offset(), 11);
        assert_eq!(chain.to_vec(), b"hello world");
        assert_eq!(chain.copy_range(6, 11), b"world");
    }

    #[test]
    fn test_append_keeps_small_slices_contiguous() {
        let mut chain = Chain::with_chunk_size(64);

        chain.append(&[b'a'; 60]);
        // Does not fit the tail, must land whole in a new chunk.
        chain.append(&[b'b'; 10]);

        assert_eq!(chain.chunks.len(), 2);
        assert_eq!(chain.chunks[1].filled(), &[b'b'; 10]);
        assert_eq!(chain.copy_range(60, 70), vec![b'b'; 10]);
    }

    #[test]
    fn test_long_append_splits() {
        let mut chain = Chain::with_chunk_size(64);
        chain.append(&vec![7u8; 200]);

        assert_eq!(chain.len(), 200);
        assert_eq!(chain.chunks.len(), 4);
        assert_eq!(chain.to_vec(), vec![7u8; 200]);
    }

    #[test]
    fn test_prepend_leaves_offsets_intact() {
        let mut chain = Chain::with_chunk_size(64);
        chain.append(b"$1\r\na\r\n");
        chain.prepend(b"*1\r\n");

        assert_eq!(chain.to_vec(), b"*1\r\n$1\r\na\r\n");
        // The original bytes keep their recorded offsets.
        assert_eq!(chain.copy_range(4, 5), b"a");
    }

    #[test]
    fn test_consume_and_rewind() {
        let mut chain = Chain::with_chunk_size(64);
        chain.append(b"*2\r\nabcdef");

        chain.consume(4);
        assert_eq!(chain.to_vec(), b"abcdef");

        chain.rewind_read();
        assert_eq!(chain.to_vec(), b"*2\r\nabcdef");
    }

    #[test]
    fn test_transfer_steals_whole_chunks() {
        let mut src = Chain::with_chunk_size(64);
        src.append(&vec![b'x'; 64]);
        src.append(&vec![b'y'; 10]);

        let mut dst = Chain::with_chunk_size(64);
        dst.append(b"hdr");
        dst.transfer_from(&mut src, 64).unwrap();

        assert_eq!(dst.len(), 67);
        // The first chunk moved wholesale, no copy of its 64 bytes.
        assert_eq!(dst.chunks.len(), 2);
        assert_eq!(src.to_vec(), vec![b'y'; 10]);
        assert_eq!(dst.copy_range(3, 67), vec![b'x'; 64]);
    }

    #[test]
    fn test_transfer_splits_on_boundary() {
        let mut src = Chain::with_chunk_size(64);
        src.append(b"aaabbb");

        let mut dst = Chain::with_chunk_size(64);
        dst.transfer_from(&mut src, 3).unwrap();

        assert_eq!(dst.to_vec(), b"aaa");
        assert_eq!(src.to_vec(), b"bbb");
        assert_eq!(src.len(), 3);
    }

    #[test]
    fn test_transfer_past_end_fails() {
        let mut src = Chain::with_chunk_size(64);
        src.append(b"ab");

        let mut dst = Chain::with_chunk_size(64);
        assert_eq!(
            dst.transfer_from(&mut src, 5),
            Err(NetError::Fatal(ErrorType::Protocol))
        );
    }

    #[test]
    fn test_repair_moves_partial_token() {
        let mut chain = Chain::with_chunk_size(64);
        let mut data = vec![b'.'; 60];
        data.extend_from_slice(b"$3\r\n");
        chain.append(&data);
        assert!(chain.chunks[0].is_full());

        // The `$3\r\n` token starts at offset 60 and hit the chunk end.
        chain.repair(60);

        assert_eq!(chain.chunks.len(), 2);
        assert_eq!(chain.chunks[0].filled().len(), 60);
        assert_eq!(chain.chunks[1].filled(), b"$3\r\n");
        assert_eq!(chain.chunks[1].base(), 60);
        assert_eq!(chain.len(), 64);

        // Appends continue in the fresh chunk, contiguous with the token.
        chain.append(b"foo");
        assert_eq!(chain.copy_range(60, 67), b"$3\r\nfoo");
    }

    #[test]
    fn test_take_tail_from_splits_pipelined_bytes() {
        let mut chain = Chain::with_chunk_size(64);
        chain.append(b"*1\r\n$4\r\nPING\r\n");
        chain.append(b"*1\r\n$4\r\nQUIT\r\n");

        let rest = chain.take_tail_from(14);

        assert_eq!(rest, b"*1\r\n$4\r\nQUIT\r\n");
        assert_eq!(chain.len(), 14);
        assert_eq!(chain.to_vec(), b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn test_take_tail_from_spans_chunks() {
        let mut chain = Chain::with_chunk_size(64);
        chain.append(&vec![b'a'; 60]);
        chain.append(&vec![b'b'; 30]);

        let rest = chain.take_tail_from(50);

        assert_eq!(rest.len(), 40);
        assert_eq!(&rest[..10], &vec![b'a'; 10][..]);
        assert_eq!(&rest[10..], &vec![b'b'; 30][..]);
        assert_eq!(chain.len(), 50);
    }

    #[test]
    fn test_ingress_until_would_block() {
        let mut channel = MockChannel::new(b"hello world".to_vec(), 4);
        let mut chain = Chain::with_chunk_size(64);

        loop {
            match chain.ingress(&mut channel) {
                Ok(n) => assert!(n > 0),
                Err(err) => {
                    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
                    break;
                }
            }
        }

        assert_eq!(chain.to_vec(), b"hello world");
    }

    #[test]
    fn test_egress_drains_and_keeps_chunks() {
        let mut chain = Chain::with_chunk_size(64);
        chain.append(b"abc");

        let mut out = Vec::new();
        let sent = chain.egress(&mut out).unwrap();

        assert_eq!(sent, 3);
        assert_eq!(out, b"abc");
        assert_eq!(chain.len(), 0);

        chain.rewind_read();
        assert_eq!(chain.to_vec(), b"abc");
    }
}
