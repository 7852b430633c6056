// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sparse, address-mapped view of a firmware image.
//!
//! An [`Image`] holds the bytes of a flashable image keyed by absolute
//! address. It can be loaded from a flat binary placed at an offset or from
//! an Intel HEX file, merged with another image, flattened back into a
//! binary, and written out as Intel HEX.
//!
//! Bytes are stored as contiguous segments keyed by base address. Adjacent
//! segments are coalesced on insertion, so every segment is non-empty and no
//! two segments touch.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

/// Number of data bytes emitted per Intel HEX data record.
const HEX_RECORD_LEN: usize = 16;

/// Execution start address carried by a HEX file, if any.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartAddress {
    /// Record type 03: CS:IP pair.
    Segment { cs: u16, ip: u16 },
    /// Record type 05: 32-bit linear entry point.
    Linear(u32),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Image {
    segments: BTreeMap<u32, Vec<u8>>,
    start: Option<StartAddress>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an image from a flat binary whose first byte lives at `offset`.
    pub fn from_binary(data: &[u8], offset: u32) -> Result<Self> {
        let mut image = Self::new();
        image.insert(offset, data)?;
        Ok(image)
    }

    pub fn from_hex_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_hex_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Parses Intel HEX text, honoring both extended segment (type 02) and
    /// extended linear (type 04) address records.
    pub fn from_hex_str(text: &str) -> Result<Self> {
        let mut image = Self::new();
        let mut base = 0u32;

        for (i, record) in ihex::Reader::new(text).enumerate() {
            let record = record
                .map_err(|e| anyhow!("bad record {}: {}", i + 1, e))?;
            match record {
                ihex::Record::Data { offset, value } => {
                    let addr = base.checked_add(u32::from(offset)).ok_or_else(
                        || anyhow!("record {} overflows address space", i + 1),
                    )?;
                    image.insert(addr, &value).with_context(|| {
                        format!("record {} overlaps earlier data", i + 1)
                    })?;
                }
                ihex::Record::ExtendedSegmentAddress(seg) => {
                    base = u32::from(seg) << 4;
                }
                ihex::Record::ExtendedLinearAddress(upper) => {
                    base = u32::from(upper) << 16;
                }
                ihex::Record::StartSegmentAddress { cs, ip } => {
                    image.start = Some(StartAddress::Segment { cs, ip });
                }
                ihex::Record::StartLinearAddress(addr) => {
                    image.start = Some(StartAddress::Linear(addr));
                }
                ihex::Record::EndOfFile => break,
            }
        }

        Ok(image)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total number of bytes present in the image.
    pub fn len(&self) -> usize {
        self.segments.values().map(Vec::len).sum()
    }

    pub fn start_address(&self) -> Option<StartAddress> {
        self.start
    }

    /// Lowest populated address.
    pub fn min_address(&self) -> Option<u32> {
        self.segments.keys().next().copied()
    }

    /// Highest populated address (inclusive).
    pub fn max_address(&self) -> Option<u32> {
        self.segments
            .iter()
            .next_back()
            .map(|(base, data)| base + (data.len() as u32 - 1))
    }

    /// Iterates over contiguous segments as `(base, bytes)`, in address order.
    pub fn segments(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        self.segments.iter().map(|(base, data)| (*base, data.as_slice()))
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.segment_containing(addr).is_some()
    }

    /// Returns the populated address that immediately precedes `addr` in
    /// sorted order, or `None` if `addr` is absent or is the lowest address.
    pub fn address_before(&self, addr: u32) -> Option<u32> {
        let (base, _) = self.segment_containing(addr)?;
        if addr > base {
            return Some(addr - 1);
        }
        self.segments
            .range(..base)
            .next_back()
            .map(|(prev, data)| prev + (data.len() as u32 - 1))
    }

    /// Inserts `data` at `addr`. Fails if any byte is already populated.
    pub fn insert(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = u64::from(addr) + data.len() as u64;
        if end > 1 << 32 {
            bail!(
                "{} bytes at {:#010x} extend past the 32-bit address space",
                data.len(),
                addr
            );
        }
        if let Some(overlap) = self.first_overlap(u64::from(addr)..end) {
            bail!(
                "address range {:#010x}..{:#010x} overlaps existing data \
                 at {:#010x}",
                addr,
                end,
                overlap
            );
        }

        // Join onto the preceding segment if it ends exactly where we start.
        let mut base = addr;
        let mut bytes = match self.segments.range(..addr).next_back() {
            Some((&prev, prev_data))
                if u64::from(prev) + prev_data.len() as u64
                    == u64::from(addr) =>
            {
                base = prev;
                self.segments.remove(&prev).unwrap_or_default()
            }
            _ => Vec::with_capacity(data.len()),
        };
        bytes.extend_from_slice(data);

        // ...and pull in the following segment if it starts right after us.
        if end < 1 << 32 {
            if let Some(next) = self.segments.remove(&(end as u32)) {
                bytes.extend_from_slice(&next);
            }
        }

        self.segments.insert(base, bytes);
        Ok(())
    }

    /// Merges every byte of `other` into this image. Any address present in
    /// both images is an error; on error `self` is left unchanged.
    pub fn merge(&mut self, other: &Image) -> Result<()> {
        for (base, data) in other.segments() {
            let range = u64::from(base)..u64::from(base) + data.len() as u64;
            if let Some(overlap) = self.first_overlap(range) {
                bail!("images overlap at address {:#010x}", overlap);
            }
        }
        let start = match (self.start, other.start) {
            (Some(a), Some(b)) if a != b => {
                bail!("images have conflicting start addresses");
            }
            (a, b) => a.or(b),
        };

        for (base, data) in other.segments() {
            self.insert(base, data)?;
        }
        self.start = start;
        Ok(())
    }

    /// Flattens `[start, start + len)` into a binary, using `fill` for any
    /// address that is not populated.
    pub fn to_binary(&self, start: u32, len: usize, fill: u8) -> Vec<u8> {
        let mut out = vec![fill; len];
        let end = u64::from(start) + len as u64;

        // The segment containing `start` may begin below it.
        let first = self
            .segment_containing(start)
            .map(|(base, _)| base)
            .unwrap_or(start);
        for (&base, data) in self.segments.range(first..) {
            let seg_start = u64::from(base);
            if seg_start >= end {
                break;
            }
            let seg_end = seg_start + data.len() as u64;
            let lo = seg_start.max(u64::from(start));
            let hi = seg_end.min(end);
            if lo >= hi {
                continue;
            }
            let dst = (lo - u64::from(start)) as usize;
            let src = (lo - seg_start) as usize;
            let n = (hi - lo) as usize;
            out[dst..dst + n].copy_from_slice(&data[src..src + n]);
        }
        out
    }

    /// Renders the image as Intel HEX, emitting extended linear address
    /// records whenever the upper 16 address bits change.
    pub fn to_hex_string(&self) -> Result<String> {
        let mut records = vec![];
        let mut upper = 0u16;

        for (base, data) in self.segments() {
            let mut addr = base;
            let mut rest = data;
            while !rest.is_empty() {
                let hi = (addr >> 16) as u16;
                if hi != upper {
                    records.push(ihex::Record::ExtendedLinearAddress(hi));
                    upper = hi;
                }
                // Data records must not straddle a 64 KiB boundary.
                let room = 0x1_0000 - (addr & 0xffff) as usize;
                let n = rest.len().min(HEX_RECORD_LEN).min(room);
                records.push(ihex::Record::Data {
                    offset: addr as u16,
                    value: rest[..n].to_vec(),
                });
                rest = &rest[n..];
                addr = addr.wrapping_add(n as u32);
            }
        }

        match self.start {
            Some(StartAddress::Segment { cs, ip }) => {
                records.push(ihex::Record::StartSegmentAddress { cs, ip })
            }
            Some(StartAddress::Linear(a)) => {
                records.push(ihex::Record::StartLinearAddress(a))
            }
            None => (),
        }
        records.push(ihex::Record::EndOfFile);

        ihex::create_object_file_representation(&records)
            .map_err(|e| anyhow!("failed to encode hex records: {}", e))
    }

    pub fn write_hex(&self, path: &Path) -> Result<()> {
        let text = self.to_hex_string()?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    fn segment_containing(&self, addr: u32) -> Option<(u32, &[u8])> {
        let (&base, data) = self.segments.range(..=addr).next_back()?;
        if u64::from(addr) < u64::from(base) + data.len() as u64 {
            Some((base, data.as_slice()))
        } else {
            None
        }
    }

    /// Lowest populated address within `range`, if any.
    fn first_overlap(&self, range: Range<u64>) -> Option<u32> {
        let start = range.start as u32;
        if self.contains(start) {
            return Some(start);
        }
        let end = range.end.min(1 << 32);
        self.segments
            .range(start..)
            .next()
            .map(|(&base, _)| base)
            .filter(|&base| u64::from(base) < end)
    }
}
