// SPDX-License-Identifier: Apache-2.0
//
// Copyright (C) 2024, ARM Limited and contributors.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may
// not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! IO layer.
//!
//! A trace file can be larger than what a single mapping window can address,
//! so [FileMapping] maps the file as a sequence of fixed-span windows, each
//! extended by a small overlap into the next one. Any fixed-width read
//! starting near a window boundary is then served from a single window
//! without crossing.

use core::mem::size_of;
use std::{
    fs::File,
    io,
    io::ErrorKind,
    path::Path,
};

use crate::header::{Endianness, FileOffset, FileSize, MemOffset, MemSize};

/// Span addressed by one mapping window.
const WINDOW_SPAN: FileSize = 1 << 31;

/// Overlap into the next window. Must be at least as large as the biggest
/// single-window read, i.e. one ring buffer page.
const WINDOW_OVERLAP: FileSize = 64 * 1024;

#[inline]
fn eof() -> io::Error {
    ErrorKind::UnexpectedEof.into()
}

/// Read-only view of a trace file as a sequence of overlapping mmap windows.
///
/// All multi-byte reads follow the byte order configured with
/// [FileMapping::set_byte_order], uniformly across windows.
pub struct FileMapping {
    windows: Vec<memmap2::Mmap>,
    len: FileSize,
    span: FileSize,
    endianness: Endianness,
}

impl FileMapping {
    /// Map the file at `path`.
    ///
    /// # Safety
    ///
    /// Undefined behavior will happen if the file is modified while it is
    /// opened from here, as Rust will not expect the underlying memory to
    /// change randomly.
    pub unsafe fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        unsafe { Self::open_with_span(path, WINDOW_SPAN, WINDOW_OVERLAP) }
    }

    /// Same as [FileMapping::open] with a caller-chosen window geometry, so
    /// the window arithmetic can be exercised on small files.
    pub(crate) unsafe fn open_with_span<P: AsRef<Path>>(
        path: P,
        span: FileSize,
        overlap: FileSize,
    ) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        let mut windows = Vec::new();
        let mut offset: FileOffset = 0;
        while offset < len {
            let window_len = (len - offset).min(span + overlap);
            let window_len: MemSize = window_len.try_into().map_err(|_| eof())?;

            //SAFETY: mmap is inherently unsafe as the memory content could
            // change without notice if the backing file is modified. We have
            // to rely on the user/OS being nice to us and not do that, or we
            // might crash, there is no way around it unfortunately.
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .offset(offset)
                    .len(window_len)
                    .map(&file)
            }?;

            // Enable read-ahead without triggering a complete read upon
            // creation of the mapping.
            let _ = mmap.advise(memmap2::Advice::WillNeed);
            let _ = mmap.advise(memmap2::Advice::Sequential);

            windows.push(mmap);
            offset += span;
        }

        Ok(FileMapping {
            windows,
            len,
            span,
            endianness: Endianness::Little,
        })
    }

    /// Byte order applied to all subsequent multi-byte reads.
    pub fn set_byte_order(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Total file size.
    #[inline]
    pub fn len(&self) -> FileSize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow `count` bytes at the absolute file offset `offset`.
    ///
    /// The read must fit in a single window: `count` cannot be larger than
    /// the window overlap when the read starts close to a window boundary.
    /// Out-of-bounds access is reported by the window slice access failing,
    /// not by an independent check against the file length.
    #[inline]
    pub fn slice(&self, offset: FileOffset, count: MemSize) -> io::Result<&[u8]> {
        let window: usize = (offset / self.span).try_into().map_err(|_| eof())?;
        let local: MemOffset = (offset % self.span).try_into().map_err(|_| eof())?;
        self.windows
            .get(window)
            .and_then(|mmap| mmap.get(local..(local + count)))
            .ok_or_else(eof)
    }

    /// Fill `buf` with the bytes at the absolute file offset `offset`.
    ///
    /// Unlike [FileMapping::slice] this can service reads of any size, by
    /// copying from as many windows as necessary.
    pub fn get(&self, offset: FileOffset, buf: &mut [u8]) -> io::Result<()> {
        let mut offset = offset;
        let mut filled: MemSize = 0;
        while filled < buf.len() {
            let in_window: MemSize = (self.span - (offset % self.span))
                .try_into()
                .unwrap_or(MemSize::MAX);
            let count = in_window.min(buf.len() - filled);
            buf[filled..(filled + count)].copy_from_slice(self.slice(offset, count)?);
            filled += count;
            offset += count as FileOffset;
        }
        Ok(())
    }

    /// Read an integer at the absolute file offset `offset`, following the
    /// configured byte order.
    #[inline]
    pub fn read_int<T: DecodeBinary>(&self, offset: FileOffset) -> io::Result<T> {
        T::decode(self.slice(offset, size_of::<T>())?, self.endianness)
    }

    /// Read an IEEE 754 double at the absolute file offset `offset`.
    #[inline]
    pub fn read_f64(&self, offset: FileOffset) -> io::Result<f64> {
        let bits: u64 = self.read_int(offset)?;
        Ok(f64::from_bits(bits))
    }
}

/// Stateful read cursor over a [FileMapping].
///
/// Primitive reads advance the internal offset by the width of the value
/// consumed. No bounds validation is performed here beyond what the mapping
/// itself propagates: the header parser is responsible for validating the
/// remaining length against [CursorReader::file_size] before each
/// variable-length read.
pub struct CursorReader<'m> {
    mapping: &'m FileMapping,
    offset: FileOffset,
}

impl<'m> CursorReader<'m> {
    #[inline]
    pub fn new(mapping: &'m FileMapping) -> Self {
        CursorReader { mapping, offset: 0 }
    }

    /// Absolute jump to `offset`.
    #[inline]
    pub fn seek(&mut self, offset: FileOffset) {
        self.offset = offset;
    }

    #[inline]
    pub fn curr_offset(&self) -> FileOffset {
        self.offset
    }

    #[inline]
    pub fn file_size(&self) -> FileSize {
        self.mapping.len()
    }

    /// Copy `count` bytes and advance the cursor past them.
    pub fn next_bytes(&mut self, count: MemSize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; count];
        self.mapping.get(self.offset, &mut buf)?;
        self.offset += count as FileOffset;
        Ok(buf)
    }

    /// Decode the next `count` bytes as text and advance the cursor past
    /// them.
    pub fn next_bytes_as_string(&mut self, count: MemSize) -> io::Result<String> {
        let buf = self.next_bytes(count)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Scan forward until a zero byte, returning the decoded text and leaving
    /// the cursor past the terminator.
    pub fn next_str(&mut self) -> io::Result<String> {
        const CHUNK: MemSize = 64;

        let mut out = Vec::new();
        loop {
            let remaining = self.mapping.len().saturating_sub(self.offset);
            if remaining == 0 {
                return Err(eof());
            }
            let count: MemSize = remaining.min(CHUNK as FileSize).try_into().unwrap();
            let mut buf = vec![0; count];
            self.mapping.get(self.offset, &mut buf)?;

            match buf.iter().position(|x| *x == 0) {
                Some(end) => {
                    out.extend_from_slice(&buf[..end]);
                    self.offset += (end + 1) as FileOffset;
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                None => {
                    out.extend_from_slice(&buf);
                    self.offset += count as FileOffset;
                }
            }
        }
    }

    /// Read an integer following the mapping byte order and advance the
    /// cursor by its width.
    #[inline]
    pub fn next_int<T: DecodeBinary>(&mut self) -> io::Result<T> {
        let x = self.mapping.read_int(self.offset)?;
        self.offset += size_of::<T>() as FileOffset;
        Ok(x)
    }

    /// Read a double and advance the cursor by its width.
    #[inline]
    pub fn next_f64(&mut self) -> io::Result<f64> {
        let x = self.mapping.read_f64(self.offset)?;
        self.offset += size_of::<f64>() as FileOffset;
        Ok(x)
    }

    /// Read a given tag (typically an ASCII string) from the input.
    ///
    /// The outer [Result] layer deals with I/O errors, the inner layer
    /// reflects whether the tag was recognized or not.
    #[inline]
    pub fn next_tag(&mut self, tag: &[u8]) -> io::Result<Result<(), ()>> {
        let buf = self.next_bytes(tag.len())?;
        Ok(if buf == tag { Ok(()) } else { Err(()) })
    }
}

pub trait DecodeBinary: Sized {
    fn decode(buf: &[u8], endianness: Endianness) -> io::Result<Self>;
}

macro_rules! impl_DecodeBinary {
    ( $($ty:ty),* ) => {
        $(
            impl DecodeBinary for $ty {
                #[inline]
                fn decode(buf: &[u8], endianness: Endianness) -> io::Result<Self> {
                    match buf.try_into() {
                        Ok(buf) => Ok(match endianness {
                            Endianness::Little => Self::from_le_bytes(buf),
                            Endianness::Big => Self::from_be_bytes(buf),
                        }),
                        Err(_) => Err(ErrorKind::UnexpectedEof.into())
                    }
                }
            }
        )*
    }
}

impl_DecodeBinary!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn mapping_of(bytes: &[u8], span: FileSize, overlap: FileSize) -> FileMapping {
        let mut file = tempfile::NamedTempFile::new().expect("Could not create temp file");
        file.write_all(bytes).expect("Could not write temp file");
        file.flush().unwrap();
        unsafe { FileMapping::open_with_span(file.path(), span, overlap) }
            .expect("Could not map file")
    }

    #[test]
    fn window_boundary_test() {
        let data: Vec<u8> = (0u8..=255).collect();
        let mapping = mapping_of(&data, 64, 16);

        // Within the first window.
        assert_eq!(mapping.slice(0, 4).unwrap(), &[0, 1, 2, 3]);
        // Starting near the end of a window, served from its overlap.
        assert_eq!(mapping.slice(62, 4).unwrap(), &[62, 63, 64, 65]);
        // Starting exactly on a window boundary.
        assert_eq!(mapping.slice(64, 2).unwrap(), &[64, 65]);
        // In a later window.
        assert_eq!(mapping.slice(200, 3).unwrap(), &[200, 201, 202]);

        // Cross-window copy larger than the overlap.
        let mut buf = [0; 100];
        mapping.get(50, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[50..150]);

        // Out of bounds reads fail rather than panic.
        assert!(mapping.slice(256, 1).is_err());
        assert!(mapping.slice(1 << 40, 1).is_err());
        let mut buf = [0; 8];
        assert!(mapping.get(252, &mut buf).is_err());
    }

    #[test]
    fn endianness_test() {
        let mut mapping = mapping_of(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08], 64, 16);

        assert_eq!(mapping.read_int::<u32>(0).unwrap(), 0x04030201);
        assert_eq!(mapping.read_int::<u16>(2).unwrap(), 0x0403);

        mapping.set_byte_order(Endianness::Big);
        assert_eq!(mapping.read_int::<u32>(0).unwrap(), 0x01020304);
        assert_eq!(mapping.read_int::<u64>(0).unwrap(), 0x0102030405060708);
    }

    #[test]
    fn cursor_test() {
        let mut data = Vec::new();
        data.extend_from_slice(b"magic");
        data.extend_from_slice(b"hello world\0");
        data.extend_from_slice(&42u32.to_le_bytes());
        data.extend_from_slice(&7u64.to_le_bytes());

        let mapping = mapping_of(&data, 8, 8);
        let mut cursor = CursorReader::new(&mapping);

        assert_eq!(cursor.next_bytes(5).unwrap(), b"magic");
        assert_eq!(cursor.next_str().unwrap(), "hello world");
        assert_eq!(cursor.next_int::<u32>().unwrap(), 42);
        assert_eq!(cursor.next_int::<u64>().unwrap(), 7);
        assert_eq!(cursor.curr_offset(), data.len() as FileOffset);
        assert_eq!(cursor.file_size(), data.len() as FileSize);

        cursor.seek(5);
        assert_eq!(cursor.next_str().unwrap(), "hello world");

        // A string missing its terminator reaches the end of file.
        let mapping = mapping_of(b"abc", 8, 8);
        let mut cursor = CursorReader::new(&mapping);
        assert!(cursor.next_str().is_err());
    }

    #[test]
    fn tag_test() {
        let mapping = mapping_of(b"flyrecord\0xyz", 64, 16);
        let mut cursor = CursorReader::new(&mapping);
        assert_eq!(cursor.next_tag(b"flyrecord\0").unwrap(), Ok(()));
        let mut cursor = CursorReader::new(&mapping);
        assert_eq!(cursor.next_tag(b"latency  \0").unwrap(), Err(()));
    }
}
