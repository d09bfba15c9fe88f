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

//! Binary ftrace (trace.dat v6) header parsing.
//!
//! The user-visible entry type is [`Header`], built once by [`Header::parse`]
//! with a single sequential pass over the file and shared read-only by every
//! iterator afterwards.

use core::{
    fmt::{Debug, Display, Formatter},
    str::from_utf8,
};
use std::{collections::BTreeMap, io, io::Error as IoError, sync::Arc};

use nom::{
    Parser,
    branch::alt,
    bytes::complete::{is_a, is_not, tag},
    character::complete::{char, multispace0, multispace1, u16 as txt_u16, u32 as txt_u32},
    combinator::{iterator, opt, rest},
    error::context,
    multi::{fold_many0, many0, separated_list0},
    sequence::{delimited, pair, preceded, separated_pair, terminated},
};
use once_cell::sync::OnceCell;

use crate::{
    error::convert_err_impl,
    io::{CursorReader, FileMapping},
    parser::{
        FromParseError, NomError, NomParserExt as _, VerboseParseError, hex_u64, lexeme,
        map_res_cut, to_str,
    },
};

/// Type alias for a memory address contained in the trace.
///
/// We cannot use [usize] since this would represent a memory address on the
/// host running the parser, which may be of a different architecture than the
/// system that produced the trace.
pub type Address = u64;
/// Alias for a CPU ID.
pub type Cpu = u32;
/// Alias for a process ID (PID).
pub type Pid = u32;
/// Alias for a nanosecond timestamp.
pub type Timestamp = u64;
/// Alias for an offset to a [Timestamp].
pub type TimeOffset = i64;
/// Alias for an ELF symbol name.
pub type SymbolName = String;
/// Alias for a Linux task name (also known as "comm" in various places).
pub type TaskName = String;
/// Alias for an event field identifier.
pub type Identifier = String;
/// Alias for an ftrace event ID.
pub type EventId = u16;

/// Alias for an offset from the beginning of a file.
pub type FileOffset = u64;
/// Alias for the size of a file.
pub type FileSize = FileOffset;

/// Alias for an offset from the beginning of memory, on the machine running
/// the parser.
pub type MemOffset = usize;
/// Alias for the size of an object in memory, on the machine running the
/// parser.
pub type MemSize = MemOffset;

/// Magic bytes opening a trace.dat file.
const MAGIC: &[u8] = b"\x17\x08\x44tracing";

/// Size of the header in front of each ring buffer page: 8-byte timestamp
/// plus the long-sized commit word, stored as 8 bytes in the page scan.
pub(crate) const PAGE_HEADER_SIZE: FileSize = 16;

/// Encode the endianness of a piece of data.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub enum Endianness {
    Big,
    Little,
}

macro_rules! parse_N {
    ($name:ident, $typ:ty) => {
        #[doc = concat!("Parse a [", stringify!($typ), "] from a buffer, following the `Self` endianness.")]
        #[inline]
        pub fn $name<'a>(&self, input: &'a [u8]) -> Result<(&'a [u8], $typ), io::Error> {
            let arr = input
                .get(..size_of::<$typ>())
                .ok_or(io::Error::from(io::ErrorKind::UnexpectedEof))?;
            let arr: [u8; size_of::<$typ>()] = arr.try_into().unwrap();
            let x = match self {
                Endianness::Big => <$typ>::from_be_bytes(arr),
                Endianness::Little => <$typ>::from_le_bytes(arr),
            };
            let input = &input[size_of::<$typ>()..];
            Ok((input, x))
        }
    };
}

impl Endianness {
    /// Return the native endianness of the machine running this library.
    fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    /// Returns [true] if `Self` is the native endianness.
    pub fn is_native(&self) -> bool {
        self == &Self::native()
    }

    parse_N!(parse_u64, u64);
    parse_N!(parse_u32, u32);
    parse_N!(parse_u16, u16);
    parse_N!(parse_u8, u8);
}

/// Size of the *long* C type in the kernel that produced the trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LongSize {
    /// 4 bytes long
    Bits32,
    /// 8 bytes long
    Bits64,
}

/// Convert the size of the *long* type to a size in bytes.
impl From<LongSize> for usize {
    fn from(size: LongSize) -> Self {
        match size {
            LongSize::Bits32 => 4,
            LongSize::Bits64 => 8,
        }
    }
}

/// Whether a number is signed or unsigned.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Signedness {
    Signed,
    Unsigned,
}

impl Display for Signedness {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        let s = match self {
            Signedness::Signed => "signed",
            Signedness::Unsigned => "unsigned",
        };
        f.write_str(s)
    }
}

/// Encodes ABI details necessary to decode the binary parts of a trace.dat
/// file.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Abi {
    /// Endianness in the kernel of the machine that generated the trace.
    pub endianness: Endianness,
    /// Long size in the kernel of the machine that generated the trace.
    pub long_size: LongSize,
}

macro_rules! abi_parse_N {
    ($name:ident, $typ:ty) => {
        #[doc = concat!("Parse a [", stringify!($typ), "] from a buffer.")]
        #[inline]
        pub fn $name<'a>(&self, input: &'a [u8]) -> Result<(&'a [u8], $typ), io::Error> {
            self.endianness.$name(input)
        }
    };
}

impl Abi {
    abi_parse_N!(parse_u64, u64);
    abi_parse_N!(parse_u32, u32);
    abi_parse_N!(parse_u16, u16);
    abi_parse_N!(parse_u8, u8);

    /// Parse an *unsigned long* from a buffer.
    pub fn parse_ulong<'a>(&self, input: &'a [u8]) -> Result<(&'a [u8], u64), io::Error> {
        match self.long_size {
            LongSize::Bits32 => self
                .parse_u32(input)
                .map(|(remaining, x)| (remaining, x.into())),
            LongSize::Bits64 => self.parse_u64(input),
        }
    }
}

/// Array shape of an event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    /// Plain scalar field.
    NotArray,
    /// Array with a length known from the field declaration.
    Fixed(usize),
    /// Array declared without a length (`[]` or a symbolic length).
    Unknown,
}

/// Binary format of one trace event field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFmt {
    /// Name of the field.
    pub name: Identifier,
    /// Declared C type, without the field name.
    pub type_name: String,
    /// Offset of the field in the binary content of an event.
    pub offset: MemOffset,
    /// Size of the field in the binary content of an event.
    pub size: MemSize,
    /// Signedness as reported by the kernel.
    pub signedness: Signedness,
    pub array: ArrayKind,
    /// The field holds a kernel pointer.
    pub is_pointer: bool,
    /// The field holds in-line text.
    pub is_string: bool,
    /// The field is a `__data_loc` packed (length << 16 | offset) reference
    /// to a dynamic payload area.
    pub is_data_loc: bool,
}

/// Lookup a field by name in an ordered field list.
pub fn field_by_name<'a>(fields: &'a [FieldFmt], name: &str) -> Option<&'a FieldFmt> {
    fields.iter().find(|field| field.name == name)
}

/// Binary and print format of an ftrace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFmt {
    /// Unique ID of that event in the header.
    pub id: EventId,
    /// Name of the ftrace event, without the subsystem name.
    pub name: String,
    /// Fields shared by every event, in declaration order.
    pub common_fields: Vec<FieldFmt>,
    /// Event-specific fields, in declaration order.
    pub fields: Vec<FieldFmt>,
    /// Raw print format string, kept unparsed.
    pub print_fmt: String,
}

impl EventFmt {
    pub fn field_by_name(&self, name: &str) -> Option<&FieldFmt> {
        field_by_name(&self.common_fields, name).or_else(|| field_by_name(&self.fields, name))
    }
}

/// Descriptor of an ftrace event.
///
/// The format block is kept unparsed until first use, as only a handful of
/// the declared events typically appear in a trace.
#[derive(Debug)]
pub struct EventDesc {
    /// Name of the ftrace event.
    pub name: String,
    /// Unique ID of that event in the header. It is not unique across files.
    pub id: EventId,
    /// Raw format in ASCII as encoded in the header.
    raw_fmt: Vec<u8>,
    fmt: OnceCell<Result<EventFmt, HeaderError>>,
}

impl EventDesc {
    /// Raw ASCII format of the event as found in
    /// `/sys/kernel/tracing/events/*/*/format`.
    #[inline]
    pub fn raw_fmt(&self) -> &[u8] {
        &self.raw_fmt
    }

    /// Parsed format, memoized on first access.
    #[inline]
    pub fn event_fmt(&self) -> Result<&EventFmt, HeaderError> {
        match self
            .fmt
            .get_or_init(|| parse_event_fmt(self.id, &self.name, &self.raw_fmt))
        {
            Ok(x) => Ok(x),
            Err(err) => Err(err.clone()),
        }
    }
}

impl PartialEq<Self> for EventDesc {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name && self.raw_fmt == other.raw_fmt
    }
}
impl Eq for EventDesc {}

/// Record-header constants advertised by the `header_event` block.
///
/// The values have been stable for every kernel that emits this format, but
/// they are parsed rather than assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderEventInfo {
    /// Number of bits of the type-length bitfield in a record header word.
    pub type_len_bits: u32,
    /// Number of bits of the time-delta bitfield in a record header word.
    pub time_delta_bits: u32,
    /// Type-length value marking a padding record.
    pub padding_type_len: u32,
    /// Type-length value marking an extended-timestamp record.
    pub time_extend_type_len: u32,
    /// Type-length value marking an absolute-timestamp record.
    pub time_stamp_type_len: u32,
    /// Largest type-length value encoding a payload size directly.
    pub data_max_type_len: u32,
    /// Type-length value marking a record with an explicit length word.
    pub custom_len_type_len: u32,
}

impl Default for HeaderEventInfo {
    fn default() -> Self {
        HeaderEventInfo {
            type_len_bits: 5,
            time_delta_bits: 27,
            padding_type_len: 29,
            time_extend_type_len: 30,
            time_stamp_type_len: 31,
            data_max_type_len: 28,
            custom_len_type_len: 0,
        }
    }
}

bitflags::bitflags! {
    /// Flag bits of the per-page commit word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Events were lost between this page and the previous one.
        const MISSING_EVENTS = 1 << 31;
        /// The number of lost events is stored after the page data.
        const MISSING_EVENTS_STORED = 1 << 30;
    }
}

/// One ring buffer page inside a CPU section.
///
/// Pages of a section form a chain, expressed as indexes into the owning
/// [CpuSection::pages] arena rather than as links between page objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Absolute file offset of the page header.
    pub offset: FileOffset,
    /// Absolute file offset of the first record, past the page header.
    pub data_offset: FileOffset,
    /// Page size, including the page header.
    pub size: FileSize,
    /// Absolute timestamp of the page, recorded in the page header.
    pub timestamp: Timestamp,
    /// Raw commit word: data size in the low bits plus [PageFlags].
    pub commit: u64,
    /// Index of the next page in the section, [None] for the last one.
    pub next: Option<usize>,
}

impl Page {
    /// Number of record bytes actually committed to this page.
    #[inline]
    pub fn data_size(&self) -> FileSize {
        self.commit & ((1 << 27) - 1)
    }

    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.commit)
    }
}

/// Raw ring buffer area of one CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSection {
    pub cpu: Cpu,
    /// Absolute file offset of the section.
    pub offset: FileOffset,
    /// Byte size of the section.
    pub size: FileSize,
    /// Page arena, in file order.
    pub pages: Vec<Page>,
}

/// Options found in a trace.dat v6 header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Options {
    /// Defines a non-top-level buffer instance.
    Instance { name: String, offset: FileOffset },
    Date(String),
    CpuStat { cpu: Cpu, stat: String },
    TraceClock(String),
    Uname(String),
    Hook(String),
    TimeOffset(TimeOffset),
    CpuCount(Cpu),
    Version(String),
    ProcMaps(String),
    TraceId(u64),
    Unknown { typ: u16, data: Vec<u8> },
}

/// Kind of data payload following the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Paged per-CPU ring buffer dump.
    FlyRecord,
    /// ASCII latency format, recognized but carrying no CPU sections.
    Latency,
}

/// Main struct representing a parsed trace.dat header.
pub struct Header {
    kernel_abi: Abi,
    page_size: MemSize,
    header_fields: Vec<FieldFmt>,
    header_event: HeaderEventInfo,
    event_descs: Vec<EventDesc>,
    event_ids: BTreeMap<EventId, usize>,
    event_systems: Vec<(String, Vec<EventId>)>,
    kallsyms: BTreeMap<Address, SymbolName>,
    printk_table: BTreeMap<Address, String>,
    pid_comms: BTreeMap<Pid, TaskName>,
    options: Vec<Options>,
    file_type: FileType,
    cpu_sections: Vec<CpuSection>,
    nr_cpus: Cpu,
    common_fields: OnceCell<Vec<FieldFmt>>,
    mapping: Arc<FileMapping>,
}

impl Debug for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("Header")
            .field("kernel_abi", &self.kernel_abi)
            .field("page_size", &self.page_size)
            .field("file_type", &self.file_type)
            .field("nr_cpus", &self.nr_cpus)
            .finish_non_exhaustive()
    }
}

impl Header {
    /// ABI of the kernel that generated the trace.
    #[inline]
    pub fn kernel_abi(&self) -> &Abi {
        &self.kernel_abi
    }

    /// Page size on the host that generated the trace.
    #[inline]
    pub fn page_size(&self) -> MemSize {
        self.page_size
    }

    /// Field layout of the ring buffer page header, as described by the
    /// `header_page` block.
    #[inline]
    pub fn header_fields(&self) -> &[FieldFmt] {
        &self.header_fields
    }

    /// Record-header constants.
    #[inline]
    pub fn header_event(&self) -> &HeaderEventInfo {
        &self.header_event
    }

    /// Returns an iterator of [EventDesc] for all the ftrace events defined
    /// in the header.
    #[inline]
    pub fn event_descs(&self) -> impl Iterator<Item = &EventDesc> {
        self.event_descs.iter()
    }

    #[inline]
    pub fn event_desc_by_id(&self, id: EventId) -> Option<&EventDesc> {
        self.event_ids.get(&id).map(|idx| &self.event_descs[*idx])
    }

    #[inline]
    pub fn event_desc_by_name(&self, name: &str) -> Option<&EventDesc> {
        self.event_descs().find(move |desc| desc.name == name)
    }

    /// Named event systems and the IDs of the events they declare.
    #[inline]
    pub fn event_systems(&self) -> impl Iterator<Item = (&str, &[EventId])> {
        self.event_systems
            .iter()
            .map(|(name, ids)| (name.as_str(), ids.as_slice()))
    }

    /// Ordered common record fields, shared by every event format.
    ///
    /// Taken from the first event format declared in the header.
    pub fn common_fields(&self) -> &[FieldFmt] {
        self.common_fields.get_or_init(|| {
            self.event_descs()
                .find_map(|desc| desc.event_fmt().ok())
                .map(|fmt| fmt.common_fields.clone())
                .unwrap_or_default()
        })
    }

    /// Lookup the task name of the given PID in the PID/name table stored in
    /// the header.
    #[inline]
    pub fn comm_of(&self, pid: Pid) -> Option<&TaskName> {
        self.pid_comms.get(&pid)
    }

    /// Lookup the symbol covering address `addr`, returning the offset of
    /// `addr` into the symbol and the symbol name.
    pub fn sym_at(&self, addr: Address) -> Option<(Address, &str)> {
        use std::ops::Bound::{Included, Unbounded};
        if addr == 0 {
            None
        } else {
            self.kallsyms
                .range((Unbounded, Included(addr)))
                .last()
                .map(|(base, s)| (addr - base, s.as_str()))
        }
    }

    /// Dereference an address in the printk string table embedded in the
    /// header.
    #[inline]
    pub fn printk_str(&self, addr: Address) -> Option<&str> {
        self.printk_table.get(&addr).map(|s| s.as_str())
    }

    /// Parsed content of `/proc/kallsyms` encoded in the header.
    #[inline]
    pub fn kallsyms(&self) -> impl Iterator<Item = (Address, &str)> {
        self.kallsyms.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Content of the PID/task name table as an iterator.
    #[inline]
    pub fn pid_comms(&self) -> impl Iterator<Item = (Pid, &str)> {
        self.pid_comms.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Header options encoded in the header.
    #[inline]
    pub fn options(&self) -> impl Iterator<Item = &Options> {
        self.options.iter()
    }

    #[inline]
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Per-CPU raw data sections, empty for latency files.
    #[inline]
    pub fn cpu_sections(&self) -> &[CpuSection] {
        &self.cpu_sections
    }

    /// Number of CPUs recorded in that trace.
    #[inline]
    pub fn nr_cpus(&self) -> Cpu {
        self.nr_cpus
    }

    /// Shared mapping of the trace file, used for page access by the
    /// iterators.
    #[inline]
    pub fn mapping(&self) -> &Arc<FileMapping> {
        &self.mapping
    }

    /// Parse a [Header] from a mapped trace file.
    ///
    /// This performs one sequential pass, validating every length field
    /// against the remaining file size before consuming the block it
    /// describes, so a truncated or corrupt file fails early with a
    /// [HeaderError::TruncatedFile] naming the offending read.
    pub fn parse(mapping: FileMapping) -> Result<Header, HeaderError> {
        let mut mapping = mapping;

        let (abi, prefix_end) = {
            let mut cursor = CursorReader::new(&mapping);
            cursor.next_tag(MAGIC)?.map_err(|_| HeaderError::BadMagic)?;

            let version = cursor.next_str()?;
            let version: u64 = version
                .trim()
                .parse()
                .map_err(|_| HeaderError::InvalidVersion(version.clone()))?;
            if version != 6 {
                return Err(HeaderError::UnsupportedVersion(version));
            }

            let endianness: u8 = cursor.next_int()?;
            let endianness = match endianness {
                0 => Ok(Endianness::Little),
                1 => Ok(Endianness::Big),
                x => Err(HeaderError::InvalidEndianness(x)),
            }?;

            let long_size: u8 = cursor.next_int()?;
            let long_size = match long_size {
                4 => Ok(LongSize::Bits32),
                8 => Ok(LongSize::Bits64),
                x => Err(HeaderError::InvalidLongSize(x)),
            }?;

            (
                Abi {
                    endianness,
                    long_size,
                },
                cursor.curr_offset(),
            )
        };

        // From here on every multi-byte value follows the file endianness.
        mapping.set_byte_order(abi.endianness);

        let mut cursor = CursorReader::new(&mapping);
        cursor.seek(prefix_end);

        let page_size: u32 = cursor.next_int()?;
        let page_size: MemSize = page_size as MemSize;

        let header_fields = parse_header_page_section(&mut cursor)?;
        let header_event = parse_header_event_section(&mut cursor)?;

        let mut event_descs = parse_event_descs(&mut cursor)?;
        let mut event_systems = Vec::new();

        let nr_systems: u32 = cursor.next_int()?;
        for _ in 0..nr_systems {
            let system_name = cursor.next_str()?;
            let descs = parse_event_descs(&mut cursor)?;
            event_systems.push((system_name, descs.iter().map(|desc| desc.id).collect()));
            event_descs.extend(descs);
        }

        let kallsyms = {
            let size: u32 = cursor.next_int()?;
            let block = checked_block(&mut cursor, size.into())?;
            parse_kallsyms.parse_finish(&block[..])?
        };

        let printk_table = {
            let size: u32 = cursor.next_int()?;
            let block = checked_block(&mut cursor, size.into())?;
            parse_printk_table.parse_finish(&block[..])?
        };

        let pid_comms = {
            let size: u64 = cursor.next_int()?;
            let block = checked_block(&mut cursor, size)?;
            parse_pid_comms.parse_finish(&block[..])?
        };

        let nr_cpus: u32 = cursor.next_int()?;

        let mut options = Vec::new();
        let mut kind = next_section_tag(&mut cursor)?;
        if kind == "options" {
            options = parse_options_section(&abi, &mut cursor)?;
            kind = next_section_tag(&mut cursor)?;
        }

        let (file_type, cpu_sections) = match kind.as_str() {
            "latency" => (FileType::Latency, Vec::new()),
            "flyrecord" => (
                FileType::FlyRecord,
                parse_flyrecord_section(&mut cursor, nr_cpus, page_size)?,
            ),
            _ => return Err(HeaderError::UnsupportedDataFmt(Some(kind))),
        };

        let event_ids = event_descs
            .iter()
            .enumerate()
            .map(|(idx, desc)| (desc.id, idx))
            .collect();

        Ok(Header {
            kernel_abi: abi,
            page_size,
            header_fields,
            header_event,
            event_descs,
            event_ids,
            event_systems,
            kallsyms,
            printk_table,
            pid_comms,
            options,
            file_type,
            cpu_sections,
            nr_cpus,
            common_fields: OnceCell::new(),
            mapping: Arc::new(mapping),
        })
    }
}

/// Error type used in [Header] methods and manipulation functions.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HeaderError {
    #[error("Bad magic found")]
    BadMagic,

    #[error("Could not decode UTF-8 string: {0}")]
    DecodeUtf8(String),

    #[error("Could not parse file format version: {0}")]
    InvalidVersion(String),

    #[error("File format version not supported: {0}")]
    UnsupportedVersion(u64),

    #[error("Expected 0 or 1 for endianness, got: {0}")]
    InvalidEndianness(u8),

    #[error("Invalid long size: {0}")]
    InvalidLongSize(u8),

    #[error(
        "Would read past the end of the file: {len} bytes requested at offset {offset}, file size is {file_size}"
    )]
    TruncatedFile {
        offset: FileOffset,
        len: FileSize,
        file_size: FileSize,
    },

    #[error("Could not parse field declaration")]
    InvalidDeclaration,

    #[error("Missing field property: {0}")]
    MissingFieldProperty(&'static str),

    #[error("Could not parse value of field property \"{0}\": {1}")]
    InvalidFieldProperty(&'static str, String),

    #[error("Expected header page start")]
    ExpectedHeaderPage,

    #[error("Expected header event start")]
    ExpectedHeaderEvent,

    #[error("Could not parse option {0} in header: {1}")]
    InvalidOption(u16, String),

    #[error("Data format not supported: {}", .0.as_deref().unwrap_or("<unknown>"))]
    UnsupportedDataFmt(Option<String>),

    #[error("Error while loading data: {0}")]
    IoError(Box<io::ErrorKind>),

    #[error("Could not parse header: {0}")]
    ParseError(Box<VerboseParseError>),
}
convert_err_impl!(io::ErrorKind, IoError, HeaderError);

impl From<IoError> for HeaderError {
    fn from(err: IoError) -> HeaderError {
        err.kind().into()
    }
}

impl<I: AsRef<[u8]>, I2: AsRef<[u8]>> FromParseError<I, nom_language::error::VerboseError<I2>>
    for HeaderError
{
    fn from_parse_error(input: I, err: &nom_language::error::VerboseError<I2>) -> Self {
        HeaderError::ParseError(Box::new(VerboseParseError::new(input, err)))
    }
}

impl<I: AsRef<[u8]>> FromParseError<I, ()> for HeaderError {
    fn from_parse_error(input: I, _err: &()) -> Self {
        HeaderError::ParseError(Box::new(VerboseParseError::from_input(input)))
    }
}

type HeaderNomError<'a> = NomError<HeaderError, nom_language::error::VerboseError<&'a [u8]>>;

/// Check that `len` more bytes can be consumed, then consume them.
///
/// This is the primary defense against corrupt or truncated files: every
/// length field read from the file goes through here before the block it
/// describes is consumed.
fn checked_block(cursor: &mut CursorReader, len: FileSize) -> Result<Vec<u8>, HeaderError> {
    check_remaining(cursor, len)?;
    Ok(cursor.next_bytes(len as MemSize)?)
}

fn check_remaining(cursor: &CursorReader, len: FileSize) -> Result<(), HeaderError> {
    let offset = cursor.curr_offset();
    let file_size = cursor.file_size();
    match offset.checked_add(len) {
        Some(end) if end <= file_size => Ok(()),
        _ => Err(HeaderError::TruncatedFile {
            offset,
            len,
            file_size,
        }),
    }
}

/// Read one of the 10-byte section tags ("options  ", "latency  ",
/// "flyrecord"), trimmed of padding.
fn next_section_tag(cursor: &mut CursorReader) -> Result<String, HeaderError> {
    check_remaining(cursor, 10)?;
    let tag = cursor.next_bytes_as_string(10)?;
    Ok(tag.trim_end_matches(['\0', ' ']).to_string())
}

fn parse_header_page_section(cursor: &mut CursorReader) -> Result<Vec<FieldFmt>, HeaderError> {
    cursor
        .next_tag(b"header_page\0")?
        .map_err(|_| HeaderError::ExpectedHeaderPage)?;
    let size: u64 = cursor.next_int()?;
    let block = checked_block(cursor, size)?;
    let fields = parse_struct_fields.parse_finish(&block[..])?;
    Ok(fields)
}

fn parse_header_event_section(cursor: &mut CursorReader) -> Result<HeaderEventInfo, HeaderError> {
    cursor
        .next_tag(b"header_event\0")?
        .map_err(|_| HeaderError::ExpectedHeaderEvent)?;
    let size: u64 = cursor.next_int()?;
    let block = checked_block(cursor, size)?;
    let info = parse_header_event.parse_finish(&block[..])?;
    Ok(info)
}

fn parse_event_descs(cursor: &mut CursorReader) -> Result<Vec<EventDesc>, HeaderError> {
    let nr_descs: u32 = cursor.next_int()?;
    let mut descs = Vec::with_capacity(nr_descs as usize);
    for _ in 0..nr_descs {
        let size: u64 = cursor.next_int()?;
        let block = checked_block(cursor, size)?;
        descs.push(parse_event_desc.parse_finish(&block[..])?);
    }
    Ok(descs)
}

/// Parse the content of one `/sys/kernel/tracing/events/*/*/format` block.
fn parse_event_desc(input: &[u8]) -> nom::IResult<&[u8], EventDesc, HeaderNomError<'_>> {
    context(
        "event description",
        map_res_cut(
            (
                context(
                    "event name",
                    preceded(
                        lexeme(tag(&b"name:"[..])),
                        lexeme(terminated(is_not("\n"), char('\n'))),
                    ),
                ),
                context("event ID", preceded(lexeme(tag(&b"ID:"[..])), lexeme(txt_u16))),
                context("remainder", rest),
            ),
            |(name, id, fmt): (&[u8], _, &[u8])| {
                Ok(EventDesc {
                    name: to_str(name),
                    id,
                    // Store the unparsed content, as parsing is costly and
                    // only a handful of events will typically be actually
                    // used in the trace.
                    raw_fmt: fmt.to_vec(),
                    fmt: OnceCell::new(),
                })
            },
        ),
    )
    .parse(input)
}

/// Parse the `format:`/`print fmt:` body of an event description.
fn parse_event_fmt(id: EventId, name: &str, input: &[u8]) -> Result<EventFmt, HeaderError> {
    context(
        "event format",
        map_res_cut(
            (
                preceded(
                    pair(lexeme(tag(&b"format:"[..])), multispace0),
                    parse_struct_fields,
                ),
                preceded(pair(multispace0, tag(&b"print fmt:"[..])), rest),
            ),
            |(fields, print_fmt): (Vec<FieldFmt>, &[u8])| {
                let (common_fields, fields) = fields
                    .into_iter()
                    .partition(|field| field.name.starts_with("common_"));
                Ok::<_, HeaderError>(EventFmt {
                    id,
                    name: name.into(),
                    common_fields,
                    fields,
                    print_fmt: to_str(print_fmt).trim().to_string(),
                })
            },
        ),
    )
    .parse_finish(input)
}

/// Parse the struct format of an ftrace event as reported in
/// `/sys/kernel/tracing/events/*/*/format`.
fn parse_struct_fields(input: &[u8]) -> nom::IResult<&[u8], Vec<FieldFmt>, HeaderNomError<'_>> {
    terminated(
        separated_list0(
            char('\n'),
            map_res_cut(
                preceded(
                    lexeme(tag(&b"field:"[..])),
                    separated_pair(
                        is_not(";"),
                        char(';'),
                        terminated(
                            separated_list0(
                                char(';'),
                                separated_pair(
                                    preceded(is_a("\t "), is_not("\n:").map(to_str)),
                                    char(':'),
                                    is_not(";").map(to_str),
                                ),
                            ),
                            char(';'),
                        ),
                    ),
                ),
                |(declaration, props): (&[u8], Vec<(String, String)>)| {
                    let props = BTreeMap::from_iter(props);
                    macro_rules! get {
                        ($name:expr) => {{
                            let raw = props
                                .get($name)
                                .ok_or(HeaderError::MissingFieldProperty($name))?;
                            raw.trim().parse().map_err(|_| {
                                HeaderError::InvalidFieldProperty($name, raw.clone())
                            })?
                        }};
                    }

                    let decl = parse_declaration(declaration)?;
                    let signedness = {
                        let signed: u8 = get!("signed");
                        if signed > 0 {
                            Signedness::Signed
                        } else {
                            Signedness::Unsigned
                        }
                    };

                    Ok(FieldFmt {
                        name: decl.name,
                        type_name: decl.type_name,
                        offset: get!("offset"),
                        size: get!("size"),
                        signedness,
                        array: decl.array,
                        is_pointer: decl.is_pointer,
                        is_string: decl.is_string,
                        is_data_loc: decl.is_data_loc,
                    })
                },
            ),
        ),
        opt(char('\n')),
    )
    .parse(input)
}

struct Declaration {
    name: Identifier,
    type_name: String,
    array: ArrayKind,
    is_pointer: bool,
    is_string: bool,
    is_data_loc: bool,
}

/// Split a field declaration such as `__data_loc char[] name` or
/// `unsigned long addrs[4]` into its name, type and the traits driving the
/// field decoder.
fn parse_declaration(decl: &[u8]) -> Result<Declaration, HeaderError> {
    let decl = from_utf8(decl).map_err(|err| HeaderError::DecodeUtf8(err.to_string()))?;
    let mut decl = decl.trim().to_string();

    let is_data_loc = decl.starts_with("__data_loc");
    if is_data_loc {
        decl = decl["__data_loc".len()..].trim_start().to_string();
    }

    let array = match decl.find('[') {
        None => ArrayKind::NotArray,
        Some(start) => {
            let end = decl[start..]
                .find(']')
                .map(|end| start + end)
                .ok_or(HeaderError::InvalidDeclaration)?;
            let len = decl[(start + 1)..end].trim();
            let kind = if len.is_empty() {
                ArrayKind::Unknown
            } else {
                match len.parse() {
                    Ok(len) => ArrayKind::Fixed(len),
                    // Symbolic array length that the kernel did not resolve.
                    Err(_) => ArrayKind::Unknown,
                }
            };
            decl.replace_range(start..=end, "");
            kind
        }
    };

    let is_pointer = decl.contains('*');

    let name = decl
        .split_whitespace()
        .last()
        .map(|name| name.trim_start_matches('*'))
        .filter(|name| !name.is_empty())
        .ok_or(HeaderError::InvalidDeclaration)?
        .to_string();

    let type_name = decl[..decl.rfind(&name).unwrap()]
        .trim()
        .trim_end_matches('*')
        .trim()
        .to_string();

    let is_char = type_name
        .split_whitespace()
        .any(|token| token == "char" || token == "char[]");
    let is_string = !is_pointer && is_char && (array != ArrayKind::NotArray || is_data_loc);

    Ok(Declaration {
        name,
        type_name,
        array,
        is_pointer,
        is_string,
        is_data_loc,
    })
}

/// Parse the `header_event` block describing the record-header constants.
fn parse_header_event(input: &[u8]) -> nom::IResult<&[u8], HeaderEventInfo, HeaderNomError<'_>> {
    preceded(
        opt(lexeme(preceded(char('#'), many0(is_not("\n"))))),
        fold_many0(
            terminated(
                alt((
                    preceded(
                        (
                            lexeme(tag(&b"data"[..])),
                            lexeme(tag(&b"max"[..])),
                            lexeme(tag(&b"type_len"[..])),
                            lexeme(tag(&b"=="[..])),
                        ),
                        lexeme(txt_u32),
                    )
                    .map(|value| ("data max type_len".to_string(), value)),
                    separated_pair(
                        lexeme(is_not(" \t\n:").map(to_str)),
                        lexeme(char(':')),
                        delimited(
                            opt(pair(lexeme(tag(&b"type"[..])), lexeme(tag(&b"=="[..])))),
                            lexeme(txt_u32),
                            opt(lexeme(tag(&b"bits"[..]))),
                        ),
                    ),
                )),
                opt(many0(char('\n'))),
            ),
            HeaderEventInfo::default,
            |mut info, (key, value)| {
                match key.as_str() {
                    "type_len" => info.type_len_bits = value,
                    "time_delta" => info.time_delta_bits = value,
                    "padding" => info.padding_type_len = value,
                    "time_extend" => info.time_extend_type_len = value,
                    "time_stamp" => info.time_stamp_type_len = value,
                    "data max type_len" => info.data_max_type_len = value,
                    // "array" bit width and anything else is not needed for
                    // decoding.
                    _ => (),
                }
                info
            },
        ),
    )
    .parse(input)
}

/// Parse content of `/proc/kallsyms`.
fn parse_kallsyms(
    input: &[u8],
) -> nom::IResult<&[u8], BTreeMap<Address, SymbolName>, HeaderNomError<'_>> {
    context("kallsyms", move |input| {
        let line = terminated(
            separated_pair(
                hex_u64,
                delimited(multispace1, is_not(" \t"), multispace1),
                map_res_cut(
                    pair(
                        is_not("\t\n"),
                        // The symbol name can be followed by \t[module_name],
                        // so we consume the \t in between to provide cleaner
                        // output.
                        opt(preceded(is_a(" \t"), is_not("\n"))),
                    ),
                    |(name, module): (&[u8], Option<&[u8]>)| match from_utf8(name) {
                        Ok(name) => Ok(match module.map(from_utf8) {
                            Some(Ok(module)) => {
                                let mut full: SymbolName = name.into();
                                full.push(' ');
                                full.push_str(module);
                                full
                            }
                            _ => name.into(),
                        }),
                        Err(err) => Err(HeaderError::DecodeUtf8(err.to_string())),
                    },
                ),
            ),
            char('\n'),
        );

        let mut it = iterator(input, line);
        let parsed = it.by_ref().collect::<BTreeMap<_, _>>();
        let (input, _) = it.finish()?;
        Ok((input, parsed))
    })
    .parse(input)
}

/// Parse the printk string table in the header.
///
/// The table stores a single copy of the static strings referenced by
/// pointer-typed event fields.
fn parse_printk_table(
    input: &[u8],
) -> nom::IResult<&[u8], BTreeMap<Address, String>, HeaderNomError<'_>> {
    context("printk fmt", move |input| {
        let line = separated_pair(
            preceded(tag(&b"0x"[..]), hex_u64),
            lexeme(char(':')),
            map_res_cut(terminated(is_not("\n"), char('\n')), |line: &[u8]| {
                match from_utf8(line) {
                    Ok(s) => Ok(unquote(s.trim())),
                    Err(err) => Err(HeaderError::DecodeUtf8(err.to_string())),
                }
            }),
        );
        let mut it = iterator(input, line);
        let parsed = it.by_ref().collect::<BTreeMap<_, _>>();
        let (input, _) = it.finish()?;
        Ok((input, parsed))
    })
    .parse(input)
}

/// Strip the surrounding quotes of a string literal and resolve the usual
/// escape sequences.
fn unquote(s: &str) -> String {
    let s = s.strip_prefix('"').unwrap_or(s);
    let s = s.strip_suffix('"').unwrap_or(s);

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('0') => out.push('\0'),
                Some(c) => out.push(c),
                None => break,
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse PID/task name tables.
fn parse_pid_comms(input: &[u8]) -> nom::IResult<&[u8], BTreeMap<Pid, String>, HeaderNomError<'_>> {
    context("PID map", move |input| {
        let line = separated_pair(
            txt_u32,
            multispace1,
            map_res_cut(lexeme(is_not("\n")), |x: &[u8]| match from_utf8(x) {
                Ok(s) => Ok(s.to_string()),
                Err(err) => Err(HeaderError::DecodeUtf8(err.to_string())),
            }),
        );
        let mut it = iterator(input, line);
        let parsed = it.by_ref().collect::<BTreeMap<_, _>>();
        let (input, _) = it.finish()?;
        Ok((input, parsed))
    })
    .parse(input)
}

fn option_str(option_type: u16, option_data: &[u8]) -> Result<&str, HeaderError> {
    // Sometimes there is no data at all even though the format states the
    // option payload should be a null-terminated string.
    let end = option_data
        .iter()
        .position(|x| *x == 0)
        .unwrap_or(option_data.len());
    from_utf8(&option_data[..end])
        .map_err(|err| HeaderError::InvalidOption(option_type, err.to_string()))
}

fn option_parse_offset(option_type: u16, date: &str) -> Result<TimeOffset, HeaderError> {
    let (date, sign) = match date.strip_prefix('-') {
        Some(date) => (date, -1),
        None => (date, 1),
    };

    let mut offset: TimeOffset = 0;
    for (prefix, base) in [
        (Some("0x"), 16),
        (Some("0X"), 16),
        (Some("0"), 8),
        (None, 10),
    ] {
        let (match_, date) = match prefix {
            Some(prefix) => (date.starts_with(prefix), date.trim_start_matches(prefix)),
            None => (true, date),
        };
        if match_ {
            offset = TimeOffset::from_str_radix(date, base)
                .map_err(|err| HeaderError::InvalidOption(option_type, err.to_string()))?;
            break;
        }
    }

    Ok(offset * sign)
}

/// Decode the v6 options section: (type, length, payload) triples terminated
/// by a zero type.
fn parse_options_section(
    abi: &Abi,
    cursor: &mut CursorReader,
) -> Result<Vec<Options>, HeaderError> {
    let mut options = Vec::new();
    let mut cpu_stat_cpu: Cpu = 0;

    loop {
        let option_type: u16 = cursor.next_int()?;
        if option_type == 0 {
            break;
        }
        let option_size: u32 = cursor.next_int()?;
        let option_data = checked_block(cursor, option_size.into())?;
        let option_data = &option_data[..];

        options.push(match option_type {
            // BUFFER: id 3, size vary
            3 => {
                let (option_data, offset) = abi.parse_u64(option_data)?;
                let name = option_str(option_type, option_data)?;
                Options::Instance {
                    name: name.into(),
                    offset,
                }
            }
            // DATE: id 1, size vary
            1 => Options::Date(option_str(option_type, option_data)?.into()),
            // CPUSTAT: id 2, size vary
            2 => {
                let cpu = cpu_stat_cpu;
                cpu_stat_cpu += 1;
                Options::CpuStat {
                    cpu,
                    stat: option_str(option_type, option_data)?.into(),
                }
            }
            // TRACECLOCK: id 4, size vary
            4 => Options::TraceClock(option_str(option_type, option_data)?.into()),
            // UNAME: id 5, size vary
            5 => Options::Uname(option_str(option_type, option_data)?.into()),
            // HOOK: id 6, size vary
            6 => Options::Hook(option_str(option_type, option_data)?.into()),
            // OFFSET: id 7, size vary
            7 => Options::TimeOffset(option_parse_offset(
                option_type,
                option_str(option_type, option_data)?,
            )?),
            // CPUCOUNT: id 8, size 4
            8 => Options::CpuCount(abi.parse_u32(option_data)?.1),
            // VERSION: id 9, size vary
            9 => Options::Version(option_str(option_type, option_data)?.into()),
            // PROCMAPS: id 10, size vary
            10 => Options::ProcMaps(option_str(option_type, option_data)?.into()),
            // TRACEID: id 11, size 8
            11 => Options::TraceId(abi.parse_u64(option_data)?.1),
            typ => Options::Unknown {
                typ,
                data: option_data.to_vec(),
            },
        });
    }
    Ok(options)
}

/// Decode the flyrecord section: per-CPU (offset, size) pairs followed by a
/// scan of every page header at `page_size` strides.
fn parse_flyrecord_section(
    cursor: &mut CursorReader,
    nr_cpus: Cpu,
    page_size: MemSize,
) -> Result<Vec<CpuSection>, HeaderError> {
    let mut locations = Vec::with_capacity(nr_cpus as usize);
    for cpu in 0..nr_cpus {
        let offset: u64 = cursor.next_int()?;
        let size: u64 = cursor.next_int()?;
        locations.push((cpu, offset, size));
    }

    locations
        .into_iter()
        .map(|(cpu, offset, size)| {
            let pages = scan_pages(cursor, cpu, offset, size, page_size)?;
            Ok(CpuSection {
                cpu,
                offset,
                size,
                pages,
            })
        })
        .collect()
}

fn scan_pages(
    cursor: &mut CursorReader,
    cpu: Cpu,
    section_offset: FileOffset,
    section_size: FileSize,
    page_size: MemSize,
) -> Result<Vec<Page>, HeaderError> {
    let page_size = page_size as FileSize;
    let end = section_offset
        .checked_add(section_size)
        .ok_or(HeaderError::TruncatedFile {
            offset: section_offset,
            len: section_size,
            file_size: cursor.file_size(),
        })?;

    let mut pages = Vec::new();
    let mut page_offset = section_offset;
    while page_offset < end {
        cursor.seek(page_offset);
        check_remaining(cursor, PAGE_HEADER_SIZE)?;
        let timestamp: u64 = cursor.next_int()?;
        let commit: u64 = cursor.next_int()?;

        let page = Page {
            offset: page_offset,
            data_offset: page_offset + PAGE_HEADER_SIZE,
            size: page_size,
            timestamp,
            commit,
            next: None,
        };
        if page.flags().contains(PageFlags::MISSING_EVENTS) {
            tracing::warn!(cpu, offset = page_offset, "events were lost before this page");
        }
        pages.push(page);
        page_offset += page_size;
    }

    for i in 1..pages.len() {
        pages[i - 1].next = Some(i);
    }
    Ok(pages)
}
