//! Flat segment-table executable images.
//!
//! A small stand-in for ELF that keeps the loader honest: a header names
//! the entry point, the stack top and the loadable segments, and the
//! payload carries the initial contents the pages are demand-loaded from.
//!
//! Layout, all fields little-endian `u64`:
//!
//! ```text
//! magic | entry | stack_top | nsegs
//! nsegs * { va | memsz | filesz | offset | flags }
//! payload bytes referenced by the segment offsets
//! ```

use alloc::vec::Vec;

use crate::fs::Inode;

/// Magic number opening every image.
pub const IMAGE_MAGIC: u64 = u64::from_le_bytes(*b"PGOSIMG1");

/// Segment flag bit marking the segment executable (text rather than data).
pub const SEG_FLAG_EXEC: u64 = 1;

const MAX_SEGMENTS: usize = 8;
const HEADER_LEN: usize = 8 * 4;
const SEGMENT_LEN: usize = 8 * 5;

/// One loadable segment record of an image.
#[derive(Debug, Clone, Copy)]
pub struct ImageSegment {
    /// Page-aligned virtual address the segment starts at.
    pub va: u64,
    /// Bytes the segment occupies in memory.
    pub memsz: u64,
    /// Bytes of initial contents stored in the image.
    pub filesz: u64,
    /// Offset of those contents in the image file.
    pub offset: u64,
    /// Segment flags; see [`SEG_FLAG_EXEC`].
    pub flags: u64,
}

impl ImageSegment {
    /// Whether the segment is executable.
    #[must_use]
    pub const fn is_exec(&self) -> bool {
        self.flags & SEG_FLAG_EXEC != 0
    }
}

/// Parsed view of an image header; the payload stays in the inode and is
/// read page by page on demand.
#[derive(Debug)]
pub struct Image {
    /// Virtual address of the first instruction.
    pub entry: u64,
    /// First address past the user stack.
    pub stack_top: u64,
    /// The loadable segments.
    pub segments: Vec<ImageSegment>,
}

/// Parse the header and segment table of the image stored in `inode`.
///
/// # Errors
/// Fails when the file is too short, the magic does not match, or the
/// segment table is malformed.
pub fn parse(inode: &Inode) -> Result<Image, &'static str> {
    let mut header = [0_u8; HEADER_LEN];
    if inode.read_at(0, &mut header) != HEADER_LEN {
        return Err("executable image too short");
    }

    if u64_field(&header, 0) != IMAGE_MAGIC {
        return Err("bad executable magic");
    }
    let entry = u64_field(&header, 1);
    let stack_top = u64_field(&header, 2);
    let nsegs = u64_field(&header, 3) as usize;
    if nsegs == 0 || nsegs > MAX_SEGMENTS {
        return Err("unreasonable segment count");
    }

    let mut segments = Vec::with_capacity(nsegs);
    for i in 0..nsegs {
        let mut record = [0_u8; SEGMENT_LEN];
        if inode.read_at(HEADER_LEN + i * SEGMENT_LEN, &mut record) != SEGMENT_LEN {
            return Err("truncated segment table");
        }
        let segment = ImageSegment {
            va: u64_field(&record, 0),
            memsz: u64_field(&record, 1),
            filesz: u64_field(&record, 2),
            offset: u64_field(&record, 3),
            flags: u64_field(&record, 4),
        };
        if segment.filesz > segment.memsz {
            return Err("segment file size exceeds memory size");
        }
        segments.push(segment);
    }

    Ok(Image {
        entry,
        stack_top,
        segments,
    })
}

fn u64_field(bytes: &[u8], index: usize) -> u64 {
    let mut buf = [0_u8; 8];
    buf.copy_from_slice(&bytes[index * 8..index * 8 + 8]);
    u64::from_le_bytes(buf)
}

/// Assembles an image in memory. Used by the boot demo and the tests to
/// produce executables without a cross-compiler.
#[derive(Debug)]
pub struct ImageBuilder {
    entry: u64,
    stack_top: u64,
    segments: Vec<(u64, u64, u64, Vec<u8>)>,
}

impl ImageBuilder {
    /// Start an image with the given entry point and stack top.
    #[must_use]
    pub const fn new(entry: u64, stack_top: u64) -> Self {
        Self {
            entry,
            stack_top,
            segments: Vec::new(),
        }
    }

    /// Append a segment at `va` spanning `memsz` bytes, with `contents` as
    /// its initial bytes (the rest is BSS).
    #[must_use]
    pub fn segment(mut self, va: u64, memsz: u64, exec: bool, contents: &[u8]) -> Self {
        let flags = if exec { SEG_FLAG_EXEC } else { 0 };
        self.segments.push((va, memsz, flags, contents.to_vec()));
        self
    }

    /// Serialize the image.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let table_len = HEADER_LEN + self.segments.len() * SEGMENT_LEN;
        let mut out = Vec::with_capacity(
            table_len + self.segments.iter().map(|(_, _, _, d)| d.len()).sum::<usize>(),
        );

        out.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&self.stack_top.to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u64).to_le_bytes());

        let mut payload_off = table_len as u64;
        for (va, memsz, flags, contents) in &self.segments {
            out.extend_from_slice(&va.to_le_bytes());
            out.extend_from_slice(&memsz.to_le_bytes());
            out.extend_from_slice(&(contents.len() as u64).to_le_bytes());
            out.extend_from_slice(&payload_off.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            payload_off += contents.len() as u64;
        }
        for (_, _, _, contents) in &self.segments {
            out.extend_from_slice(contents);
        }

        out
    }
}
