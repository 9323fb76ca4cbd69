use std::collections::BTreeMap;

use bytes::Bytes;

/// Reassembles stream data received out of order
///
/// Chunks are stored non-overlapping. Data that overlaps previously
/// buffered bytes must match them exactly; a peer sending two different
/// values for the same offset is broken or malicious.
#[derive(Debug, Default)]
pub(crate) struct RecvBuffer {
    /// Offset the application has read up to
    offset: u64,
    /// Buffered chunks keyed by their start offset, strictly non-overlapping
    chunks: BTreeMap<u64, Bytes>,
}

/// Overlapping retransmission disagreed with previously received bytes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Inconsistent;

impl RecvBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Splice received data into the buffer
    pub(crate) fn insert(&mut self, mut offset: u64, mut data: Bytes) -> Result<(), Inconsistent> {
        // Drop anything already consumed by the reader
        if offset + (data.len() as u64) <= self.offset {
            return Ok(());
        }
        if offset < self.offset {
            data = data.slice((self.offset - offset) as usize..);
            offset = self.offset;
        }
        if data.is_empty() {
            return Ok(());
        }

        // Verify and trim against the chunk starting at or before us
        if let Some((&start, existing)) = self.chunks.range(..=offset).next_back() {
            let existing_end = start + existing.len() as u64;
            if existing_end > offset {
                let overlap = (existing_end - offset).min(data.len() as u64) as usize;
                let existing_part =
                    &existing[(offset - start) as usize..(offset - start) as usize + overlap];
                if existing_part != &data[..overlap] {
                    return Err(Inconsistent);
                }
                data = data.slice(overlap..);
                offset += overlap as u64;
                if data.is_empty() {
                    return Ok(());
                }
            }
        }

        // Verify against every chunk we span, keeping only the gaps
        let mut cursor = offset;
        let end = offset + data.len() as u64;
        let overlapping: Vec<(u64, u64)> = self
            .chunks
            .range(offset..end)
            .map(|(&s, c)| (s, s + c.len() as u64))
            .collect();
        for (chunk_start, chunk_end) in overlapping {
            if cursor < chunk_start {
                let gap = data.slice((cursor - offset) as usize..(chunk_start - offset) as usize);
                self.chunks.insert(cursor, gap);
            }
            let overlap_end = chunk_end.min(end);
            let ours = &data[(chunk_start - offset) as usize..(overlap_end - offset) as usize];
            let theirs = &self.chunks[&chunk_start][..(overlap_end - chunk_start) as usize];
            if ours != theirs {
                return Err(Inconsistent);
            }
            cursor = overlap_end;
        }
        if cursor < end {
            self.chunks
                .insert(cursor, data.slice((cursor - offset) as usize..));
        }
        Ok(())
    }

    /// Copy contiguous data starting at the read offset into `buf`
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut read = 0;
        while read < buf.len() {
            let (&start, chunk) = match self.chunks.iter().next() {
                Some(entry) => entry,
                None => break,
            };
            if start > self.offset {
                // Hole in the stream
                break;
            }
            let skip = (self.offset - start) as usize;
            let available = chunk.len() - skip;
            let n = available.min(buf.len() - read);
            buf[read..read + n].copy_from_slice(&chunk[skip..skip + n]);
            read += n;
            self.offset += n as u64;
            if skip + n == chunk.len() {
                self.chunks.remove(&start);
            } else {
                break; // buf is full
            }
        }
        read
    }

    /// Bytes immediately readable without encountering a hole
    pub(crate) fn contiguous_len(&self) -> u64 {
        let mut end = self.offset;
        for (&start, chunk) in &self.chunks {
            if start > end {
                break;
            }
            end = end.max(start + chunk.len() as u64);
        }
        end - self.offset
    }

    /// Offset the reader has consumed up to
    pub(crate) fn read_offset(&self) -> u64 {
        self.offset
    }

    /// Discard all buffered data
    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
    }
}
