//! Ring buffer record decoding.
//!
//! A [PageIterator] walks the records of a single ring buffer page,
//! accumulating delta timestamps, and only records where the payload of the
//! current event lives ([EventDef]). The payload is materialized into an
//! [Event] on demand by [PageIterator::current_event]. A
//! [CpuSectionIterator] chains page iterators across the pages of one CPU
//! section, presenting a single stream with monotonically increasing
//! timestamps.

use core::fmt::{Display, Formatter};
use std::io;

use crate::{
    error::convert_err_impl,
    header::{
        Abi, ArrayKind, Cpu, CpuSection, Endianness, EventFmt, EventId, FieldFmt, FileOffset,
        Header, HeaderEventInfo, Identifier, MemSize, Page, Signedness, Timestamp, field_by_name,
    },
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BufferError {
    #[error("Header contains no ring buffer reference")]
    NoRingBuffer,

    #[error("I/O error while loading data: {0}")]
    IoError(Box<io::ErrorKind>),

    #[error("Error while parsing header: {0}")]
    HeaderError(Box<crate::header::HeaderError>),
}

convert_err_impl!(crate::header::HeaderError, HeaderError, BufferError);
convert_err_impl!(io::ErrorKind, IoError, BufferError);

impl From<io::Error> for BufferError {
    fn from(err: io::Error) -> BufferError {
        err.kind().into()
    }
}

/// Decoded value of one event field.
///
/// Unsigned fields always decode to [Value::U64Scalar] so that values that do
/// not fit the same-width signed type are preserved losslessly.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U64Scalar(u64),
    I64Scalar(i64),
    Str(String),
    U64Array(Vec<u64>),
    I64Array(Vec<i64>),
    Bytes(Vec<u8>),
    Unknown,
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64Scalar(x) => Some(*x),
            Value::I64Scalar(x) => Some(*x as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::U64Scalar(x) => Some(*x as i64),
            Value::I64Scalar(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        macro_rules! display_array {
            ($arr:expr) => {{
                write!(f, "[")?;
                for (i, x) in $arr.iter().enumerate() {
                    if i != 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            }};
        }
        match self {
            Value::U64Scalar(x) => write!(f, "{x}"),
            Value::I64Scalar(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
            Value::U64Array(arr) => display_array!(arr),
            Value::I64Array(arr) => display_array!(arr),
            Value::Bytes(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::Unknown => f.write_str("<unknown>"),
        }
    }
}

/// One decoded trace event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Absolute timestamp in nanoseconds.
    pub timestamp: Timestamp,
    /// CPU whose ring buffer held the record.
    pub cpu: Cpu,
    /// Event name from the resolved format.
    pub name: String,
    /// Decoded fields in format order, common fields first.
    pub fields: Vec<(Identifier, Value)>,
}

impl Event {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

/// Location of the payload of a record, recorded when the record header is
/// decoded. The payload is only read when the caller asks for the current
/// event, so merely advancing over records does no decode work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDef {
    pub payload_offset: FileOffset,
    pub payload_size: MemSize,
}

/// Extract the type-length bitfield of a 4-byte record header word.
///
/// The bitfield sits in the low bits on little-endian hosts and in the high
/// bits on big-endian hosts.
#[inline]
pub(crate) fn record_type_len(info: &HeaderEventInfo, word: u32, endianness: Endianness) -> u32 {
    match endianness {
        Endianness::Little => word & ((1 << info.type_len_bits) - 1),
        Endianness::Big => word >> (32 - info.type_len_bits),
    }
}

/// Extract the time-delta bitfield of a 4-byte record header word.
#[inline]
pub(crate) fn record_time_delta(info: &HeaderEventInfo, word: u32, endianness: Endianness) -> u64 {
    let delta = match endianness {
        Endianness::Little => word >> info.type_len_bits,
        Endianness::Big => word & ((1 << (32 - info.type_len_bits)) - 1),
    };
    delta.into()
}

/// Iterator over the records of exactly one ring buffer page.
pub struct PageIterator<'h> {
    header: &'h Header,
    page: &'h Page,
    cpu: Cpu,
    /// Current decode offset.
    offset: FileOffset,
    /// End of the committed record data.
    limit: FileOffset,
    /// Running absolute timestamp.
    timestamp: Timestamp,
    /// Type-length of the last record header word read.
    type_len: u32,
    /// Time-delta of the last record header word read.
    time_delta: u64,
    event_def: Option<EventDef>,
}

impl<'h> PageIterator<'h> {
    pub fn new(header: &'h Header, page: &'h Page, cpu: Cpu) -> Self {
        PageIterator {
            header,
            page,
            cpu,
            offset: page.data_offset,
            limit: page.data_offset + page.data_size(),
            timestamp: page.timestamp,
            type_len: 0,
            time_delta: 0,
            event_def: None,
        }
    }

    fn reset(&mut self) {
        self.offset = self.page.data_offset;
        self.timestamp = self.page.timestamp;
        self.type_len = 0;
        self.time_delta = 0;
        self.event_def = None;
    }

    /// Running timestamp, updated by every record header consumed so far.
    ///
    /// This is the key used for merge ordering and seeks. It matches the
    /// timestamp of the event materialized by [PageIterator::current_event].
    #[inline]
    pub fn current_timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn page(&self) -> &'h Page {
        self.page
    }

    #[inline]
    pub fn event_def(&self) -> Option<EventDef> {
        self.event_def
    }

    #[inline]
    fn read_u32(&mut self) -> Result<u32, BufferError> {
        let x: u32 = self.header.mapping().read_int(self.offset)?;
        self.offset += 4;
        Ok(x)
    }

    /// Read the next record header word, if one fits in the page.
    fn read_record_header(&mut self) -> Result<bool, BufferError> {
        if !self.has_next()? {
            return Ok(false);
        }
        let info = self.header.header_event();
        let endianness = self.header.kernel_abi().endianness;
        let word = self.read_u32()?;
        self.type_len = record_type_len(info, word, endianness);
        self.time_delta = record_time_delta(info, word, endianness);
        Ok(true)
    }

    /// Type-length of the next record header word, without consuming it.
    fn peek_type_len(&self) -> Result<Option<u32>, BufferError> {
        if !self.has_next()? {
            return Ok(None);
        }
        let info = self.header.header_event();
        let endianness = self.header.kernel_abi().endianness;
        let word: u32 = self.header.mapping().read_int(self.offset)?;
        Ok(Some(record_type_len(info, word, endianness)))
    }

    /// Fold the last header word into the running timestamp.
    ///
    /// Data records carry their delta in the header word directly.
    /// Absolute-timestamp and extended-timestamp records carry 27 more bits
    /// in an extra word, which is consumed here.
    fn update_timestamp(&mut self) -> Result<(), BufferError> {
        let info = *self.header.header_event();
        if self.type_len <= info.data_max_type_len {
            self.timestamp += self.time_delta;
        } else {
            let extend: u64 = self.read_u32()?.into();
            let extend = (extend << info.time_delta_bits) + self.time_delta;
            if self.type_len == info.time_extend_type_len {
                self.timestamp += extend;
            } else if self.type_len == info.time_stamp_type_len {
                self.timestamp = extend;
            }
        }
        Ok(())
    }

    fn current_payload_size(&mut self) -> Result<MemSize, BufferError> {
        let info = *self.header.header_event();
        if self.type_len == info.custom_len_type_len {
            // The next word holds the true payload length, including itself.
            let len = self.read_u32()?;
            Ok((len as MemSize).saturating_sub(4))
        } else if self.type_len <= info.data_max_type_len {
            Ok(self.type_len as MemSize * 4)
        } else {
            Ok(0)
        }
    }

    /// Locate the next data record, leaving its [EventDef] as the current
    /// event. Returns [false] when the page holds no more records.
    pub fn read_next_event(&mut self) -> Result<bool, BufferError> {
        self.event_def = None;
        let info = *self.header.header_event();

        let mut found = self.read_record_header()?;
        // Absolute and extended timestamp words come before the record they
        // apply to and may repeat. The first record of a page is a
        // zero-valued extended timestamp marker. All of them must be
        // consumed before a data record is considered found.
        loop {
            if !found {
                return Ok(false);
            }
            if self.type_len == info.time_stamp_type_len
                || self.type_len == info.time_extend_type_len
            {
                self.update_timestamp()?;
                found = self.read_record_header()?;
            } else if self.type_len == info.padding_type_len {
                // The padding length word includes itself.
                let len = self.read_u32()?;
                self.offset += u64::from(len.saturating_sub(4));
                found = self.read_record_header()?;
            } else {
                break;
            }
        }

        let payload_size = self.current_payload_size()?;
        self.event_def = Some(EventDef {
            payload_offset: self.offset,
            payload_size,
        });
        self.offset += payload_size as FileOffset;

        // Peek one more header word: a trailing time extension belongs to
        // the record just found and is folded in immediately, so the next
        // call starts exactly at the next record.
        if self.peek_type_len()? == Some(info.time_extend_type_len) {
            self.read_record_header()?;
        }
        self.update_timestamp()?;

        Ok(true)
    }

    /// Whether enough committed bytes remain in the page to hold another
    /// record header, accounting for the custom-length case needing 8 bytes.
    pub fn has_next(&self) -> Result<bool, BufferError> {
        if self.offset + 4 >= self.limit {
            return Ok(false);
        }
        let word: u32 = self.header.mapping().read_int(self.offset)?;
        if word == 0 {
            // A zero header word can only be a custom-length record, which
            // needs its length word right after. A zero length there means
            // the rest of the page is padding.
            if self.offset + 8 >= self.limit {
                return Ok(false);
            }
            let custom: u32 = self.header.mapping().read_int(self.offset + 4)?;
            if custom == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reset to the page start and scan forward until the running timestamp
    /// reaches `target`. Returns whether the target was reached within this
    /// page.
    pub fn seek(&mut self, target: Timestamp) -> Result<bool, BufferError> {
        self.reset();

        let mut found = self.read_next_event()?;
        while found && target > self.timestamp && self.has_next()? {
            found = self.read_next_event()?;
        }

        if target > self.timestamp {
            self.event_def = None;
            return Ok(false);
        }
        Ok(true)
    }

    /// Materialize the current event from its recorded [EventDef].
    ///
    /// Returns [None] when there is no current record or when the record's
    /// type does not resolve to any known event format, which is a soft
    /// failure: the record is skipped and scanning continues.
    pub fn current_event(&self) -> Result<Option<Event>, BufferError> {
        let def = match self.event_def {
            Some(def) => def,
            None => return Ok(None),
        };

        let data = match def.payload_size {
            0 => &[][..],
            size => self.header.mapping().slice(def.payload_offset, size)?,
        };

        let fmt = match self.resolve_format(data) {
            Some(fmt) => fmt?,
            None => return Ok(None),
        };

        let mut fields = Vec::with_capacity(fmt.common_fields.len() + fmt.fields.len());
        if def.payload_size > 0 {
            for field in fmt.common_fields.iter().chain(fmt.fields.iter()) {
                fields.push((field.name.clone(), decode_field(self.header, field, data)));
            }
        }

        Ok(Some(Event {
            timestamp: self.timestamp,
            cpu: self.cpu,
            name: fmt.name.clone(),
            fields,
        }))
    }

    /// Resolve the event format from the record's leading common type field.
    fn resolve_format(&self, data: &[u8]) -> Option<Result<&'h EventFmt, BufferError>> {
        let field = field_by_name(self.header.common_fields(), "common_type")?;
        let id: EventId = decode_field(self.header, field, data)
            .as_u64()?
            .try_into()
            .ok()?;
        match self.header.event_desc_by_id(id) {
            Some(desc) => Some(desc.event_fmt().map_err(Into::into)),
            None => {
                tracing::debug!(id, cpu = self.cpu, "skipping record with unknown event format");
                None
            }
        }
    }
}

/// Decode one field out of a record payload.
///
/// Decoding is total: anything that cannot be made sense of yields
/// [Value::Unknown] rather than an error, so one corrupt field does not lose
/// the rest of the event.
pub fn decode_field(header: &Header, field: &FieldFmt, data: &[u8]) -> Value {
    let abi = header.kernel_abi();

    if field.is_pointer {
        return match field_data(field, data).and_then(|bytes| decode_unsigned(abi, bytes)) {
            Some(addr) => match header.printk_str(addr) {
                Some(s) => Value::Str(s.to_string()),
                None => Value::Str(format!("0x{addr:x}")),
            },
            None => Value::Unknown,
        };
    }

    if field.is_string {
        let bytes = if field.is_data_loc {
            data_loc_range(abi, field, data).unwrap_or(&[])
        } else {
            match field_data(field, data) {
                Some(bytes) => bytes,
                None => return Value::Unknown,
            }
        };
        return Value::Str(read_c_string(bytes));
    }

    if field.is_data_loc {
        let bytes = data_loc_range(abi, field, data).unwrap_or(&[]);
        return Value::Bytes(bytes.to_vec());
    }

    match field.array {
        ArrayKind::Fixed(0) => {
            // Zero-length array: the data is the tail of the payload.
            match data.get(field.offset..) {
                Some(bytes) => Value::Bytes(bytes.to_vec()),
                None => Value::Unknown,
            }
        }
        ArrayKind::Fixed(len) if len > 1 => match field_data(field, data) {
            Some(bytes) => decode_array(abi, field, bytes, len),
            None => Value::Unknown,
        },
        ArrayKind::Unknown => match field_data(field, data) {
            Some(bytes) => Value::Bytes(bytes.to_vec()),
            None => Value::Unknown,
        },
        _ => match field_data(field, data) {
            Some(bytes) => decode_scalar(abi, field.signedness, bytes),
            None => Value::Unknown,
        },
    }
}

#[inline]
fn field_data<'d>(field: &FieldFmt, data: &'d [u8]) -> Option<&'d [u8]> {
    data.get(field.offset..(field.offset + field.size))
}

/// Resolve a `__data_loc` field: a packed (length << 16 | offset) word
/// pointing into the dynamic area of the same record.
fn data_loc_range<'d>(abi: &Abi, field: &FieldFmt, data: &'d [u8]) -> Option<&'d [u8]> {
    if field.size != 4 {
        return None;
    }
    let word = abi.parse_u32(field_data(field, data)?).ok()?.1;
    let offset = (word & 0xffff) as usize;
    let len = (word >> 16) as usize;
    data.get(offset..(offset + len))
}

fn read_c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|x| *x == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn decode_unsigned(abi: &Abi, bytes: &[u8]) -> Option<u64> {
    match bytes.len() {
        1 => Some(bytes[0].into()),
        2 => abi.parse_u16(bytes).ok().map(|(_, x)| x.into()),
        4 => abi.parse_u32(bytes).ok().map(|(_, x)| x.into()),
        8 => abi.parse_u64(bytes).ok().map(|(_, x)| x),
        _ => None,
    }
}

fn decode_scalar(abi: &Abi, signedness: Signedness, bytes: &[u8]) -> Value {
    let x = match decode_unsigned(abi, bytes) {
        Some(x) => x,
        None => return Value::Bytes(bytes.to_vec()),
    };
    match signedness {
        Signedness::Unsigned => Value::U64Scalar(x),
        Signedness::Signed => {
            // Sign-extend from the field width.
            let shift = 64 - bytes.len() * 8;
            Value::I64Scalar(((x << shift) as i64) >> shift)
        }
    }
}

fn decode_array(abi: &Abi, field: &FieldFmt, bytes: &[u8], len: usize) -> Value {
    let item_size = field.size / len;

    macro_rules! gather {
        ($signed:expr) => {{
            let mut items = Vec::with_capacity(len);
            for item in bytes.chunks_exact(item_size) {
                match decode_unsigned(abi, item) {
                    Some(x) => items.push(x),
                    None => return Value::Bytes(bytes.to_vec()),
                }
            }
            if $signed {
                let shift = 64 - item_size * 8;
                Value::I64Array(
                    items
                        .into_iter()
                        .map(|x| ((x << shift) as i64) >> shift)
                        .collect(),
                )
            } else {
                Value::U64Array(items)
            }
        }};
    }

    match (item_size, field.signedness) {
        (0, _) => Value::Bytes(bytes.to_vec()),
        // Fast path for aligned native-endianness u64 arrays.
        (8, Signedness::Unsigned) if abi.endianness.is_native() => {
            match bytemuck::try_cast_slice::<_, u64>(bytes) {
                Ok(slice) => Value::U64Array(slice.to_vec()),
                // Misaligned, or the array size is not a multiple of the
                // item size.
                Err(_) => gather!(false),
            }
        }
        (_, Signedness::Unsigned) => gather!(false),
        (_, Signedness::Signed) => gather!(true),
    }
}

/// Iterator over all the records of one CPU section, chaining page iterators
/// across the section's page arena.
pub struct CpuSectionIterator<'h> {
    header: &'h Header,
    section: &'h CpuSection,
    iter: Option<PageIterator<'h>>,
}

impl<'h> CpuSectionIterator<'h> {
    pub fn new(header: &'h Header, section: &'h CpuSection) -> Self {
        let iter = section
            .pages
            .first()
            .map(|page| PageIterator::new(header, page, section.cpu));
        CpuSectionIterator {
            header,
            section,
            iter,
        }
    }

    #[inline]
    pub fn cpu(&self) -> Cpu {
        self.section.cpu
    }

    /// Read the next record of the section. When the current page is
    /// exhausted and a next page exists, a fresh page iterator is built for
    /// it and the read retries once; otherwise the section is finished.
    pub fn read_next_event(&mut self) -> Result<bool, BufferError> {
        let Some(iter) = &mut self.iter else {
            return Ok(false);
        };
        if iter.read_next_event()? {
            return Ok(true);
        }
        match iter.page().next {
            Some(next) => {
                let page = &self.section.pages[next];
                let mut iter = PageIterator::new(self.header, page, self.section.cpu);
                let found = iter.read_next_event()?;
                self.iter = Some(iter);
                Ok(found)
            }
            None => Ok(false),
        }
    }

    /// Running timestamp of the current page iterator, used only for merge
    /// ordering and seeks.
    pub fn current_timestamp(&self) -> Timestamp {
        self.iter
            .as_ref()
            .map(|iter| iter.current_timestamp())
            .unwrap_or(0)
    }

    pub fn current_event(&self) -> Result<Option<Event>, BufferError> {
        match &self.iter {
            Some(iter) => iter.current_event(),
            None => Ok(None),
        }
    }

    #[inline]
    pub fn has_current_event(&self) -> bool {
        self.iter
            .as_ref()
            .is_some_and(|iter| iter.event_def().is_some())
    }

    /// Seek to the first event whose timestamp is at least `target`.
    ///
    /// The page chain is scanned for the last page starting at or before the
    /// target, since the target cannot be in any earlier page. If that
    /// page's events are all below the target, the immediately following
    /// page is guaranteed by construction to hold events at or above it.
    pub fn seek(&mut self, target: Timestamp) -> Result<bool, BufferError> {
        let pages = &self.section.pages;
        let Some(first) = pages.first() else {
            self.iter = None;
            return Ok(false);
        };

        let mut idx = 0;
        if target > first.timestamp {
            while let Some(next) = pages[idx].next {
                if target >= pages[next].timestamp {
                    idx = next;
                } else {
                    break;
                }
            }
        }

        let mut iter = PageIterator::new(self.header, &pages[idx], self.section.cpu);
        let mut found = iter.seek(target)?;

        if !found {
            if let Some(next) = pages[idx].next {
                iter = PageIterator::new(self.header, &pages[next], self.section.cpu);
                found = iter.seek(target)?;
            }
        }

        self.iter = Some(iter);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testutil::TraceBuilder;

    #[test]
    fn record_header_bits_test() {
        let info = HeaderEventInfo::default();

        // Little endian: type-length in the low 5 bits, delta above.
        let word = 3 | (1234 << 5);
        assert_eq!(record_type_len(&info, word, Endianness::Little), 3);
        assert_eq!(record_time_delta(&info, word, Endianness::Little), 1234);

        // Big endian: type-length in the high 5 bits, delta below.
        let word = (3 << 27) | 1234;
        assert_eq!(record_type_len(&info, word, Endianness::Big), 3);
        assert_eq!(record_time_delta(&info, word, Endianness::Big), 1234);

        // Maximum values do not bleed into each other.
        let word = 31 | (((1 << 27) - 1) << 5);
        assert_eq!(record_type_len(&info, word, Endianness::Little), 31);
        assert_eq!(
            record_time_delta(&info, word, Endianness::Little),
            (1 << 27) - 1
        );
    }

    fn scalar_field(size: MemSize, signedness: Signedness) -> FieldFmt {
        FieldFmt {
            name: "x".into(),
            type_name: "int".into(),
            offset: 0,
            size,
            signedness,
            array: ArrayKind::NotArray,
            is_pointer: false,
            is_string: false,
            is_data_loc: false,
        }
    }

    #[test]
    fn scalar_decode_test() {
        let header = TraceBuilder::new().build_header();

        // An unsigned value that does not fit the same-width signed type is
        // preserved losslessly.
        let field = scalar_field(4, Signedness::Unsigned);
        assert_eq!(
            decode_field(&header, &field, &0xffffffffu32.to_le_bytes()),
            Value::U64Scalar(4294967295)
        );

        let field = scalar_field(4, Signedness::Signed);
        assert_eq!(
            decode_field(&header, &field, &(-1i32).to_le_bytes()),
            Value::I64Scalar(-1)
        );

        let field = scalar_field(2, Signedness::Signed);
        assert_eq!(
            decode_field(&header, &field, &(-2i16).to_le_bytes()),
            Value::I64Scalar(-2)
        );

        let field = scalar_field(1, Signedness::Unsigned);
        assert_eq!(decode_field(&header, &field, &[0xff]), Value::U64Scalar(255));

        // Out-of-bounds field data decodes to Unknown instead of erroring.
        let field = scalar_field(8, Signedness::Unsigned);
        assert_eq!(decode_field(&header, &field, &[1, 2]), Value::Unknown);
    }

    #[test]
    fn string_decode_test() {
        let header = TraceBuilder::new().build_header();

        let field = FieldFmt {
            name: "comm".into(),
            type_name: "char".into(),
            offset: 0,
            size: 8,
            signedness: Signedness::Unsigned,
            array: ArrayKind::Fixed(8),
            is_pointer: false,
            is_string: true,
            is_data_loc: false,
        };
        assert_eq!(
            decode_field(&header, &field, b"bash\0\0\0\0"),
            Value::Str("bash".into())
        );
        // No terminator: the whole range is the string.
        assert_eq!(
            decode_field(&header, &field, b"12345678"),
            Value::Str("12345678".into())
        );
    }

    #[test]
    fn data_loc_decode_test() {
        let header = TraceBuilder::new().build_header();

        let field = FieldFmt {
            name: "name".into(),
            type_name: "char[]".into(),
            offset: 0,
            size: 4,
            signedness: Signedness::Unsigned,
            array: ArrayKind::Unknown,
            is_pointer: false,
            is_string: true,
            is_data_loc: true,
        };

        // (length << 16 | offset) pointing at "hi\0" past the word.
        let mut data = Vec::new();
        data.extend_from_slice(&((3u32 << 16) | 4).to_le_bytes());
        data.extend_from_slice(b"hi\0");
        assert_eq!(decode_field(&header, &field, &data), Value::Str("hi".into()));

        // An out-of-range data_loc yields an empty string.
        let data = ((100u32 << 16) | 60000).to_le_bytes();
        assert_eq!(decode_field(&header, &field, &data), Value::Str("".into()));
    }

    #[test]
    fn array_decode_test() {
        let header = TraceBuilder::new().build_header();

        let field = FieldFmt {
            name: "addrs".into(),
            type_name: "unsigned long".into(),
            offset: 0,
            size: 16,
            signedness: Signedness::Unsigned,
            array: ArrayKind::Fixed(2),
            is_pointer: false,
            is_string: false,
            is_data_loc: false,
        };
        let mut data = Vec::new();
        data.extend_from_slice(&0x1111u64.to_le_bytes());
        data.extend_from_slice(&0x2222u64.to_le_bytes());
        assert_eq!(
            decode_field(&header, &field, &data),
            Value::U64Array(vec![0x1111, 0x2222])
        );

        let field = FieldFmt {
            size: 4,
            array: ArrayKind::Fixed(4),
            signedness: Signedness::Signed,
            ..field
        };
        assert_eq!(
            decode_field(&header, &field, &[1, 0xff, 2, 0xfe]),
            Value::I64Array(vec![1, -1, 2, -2])
        );
    }

    #[test]
    fn pointer_decode_test() {
        let builder = TraceBuilder::new().printk(0xabcd, "some fmt");
        let header = builder.build_header();

        let field = FieldFmt {
            name: "ip".into(),
            type_name: "char".into(),
            offset: 0,
            size: 8,
            signedness: Signedness::Unsigned,
            array: ArrayKind::NotArray,
            is_pointer: true,
            is_string: false,
            is_data_loc: false,
        };

        // Resolved through the printk table.
        assert_eq!(
            decode_field(&header, &field, &0xabcdu64.to_le_bytes()),
            Value::Str("some fmt".into())
        );
        // Unresolved pointers fall back to their hex representation.
        assert_eq!(
            decode_field(&header, &field, &0x1234u64.to_le_bytes()),
            Value::Str("0x1234".into())
        );
    }

    #[test]
    fn page_iterator_test() {
        let header = TraceBuilder::new()
            .page(0, 1000)
            .time_extend(0, 0, 0)
            .event(0, 10, 1, &100u32.to_le_bytes())
            .event(0, 5, 1, &200u32.to_le_bytes())
            .build_header();

        let section = &header.cpu_sections()[0];
        let mut iter = PageIterator::new(&header, &section.pages[0], 0);

        assert!(iter.read_next_event().unwrap());
        assert_eq!(iter.current_timestamp(), 1010);
        let event = iter.current_event().unwrap().unwrap();
        assert_eq!(event.name, "tick");
        assert_eq!(event.timestamp, 1010);
        assert_eq!(event.cpu, 0);
        assert_eq!(event.field("value"), Some(&Value::U64Scalar(100)));
        assert_eq!(event.field("common_pid"), Some(&Value::I64Scalar(100)));

        // Idempotent: materializing twice yields the same event.
        assert_eq!(iter.current_event().unwrap().unwrap(), event);

        assert!(iter.read_next_event().unwrap());
        assert_eq!(iter.current_timestamp(), 1015);
        let event = iter.current_event().unwrap().unwrap();
        assert_eq!(event.field("value"), Some(&Value::U64Scalar(200)));

        assert!(!iter.read_next_event().unwrap());
        assert_eq!(iter.current_event().unwrap(), None);
    }

    #[test]
    fn marker_only_page_test() {
        // A page whose only content is the zero-valued extended timestamp
        // marker yields no data records.
        let header = TraceBuilder::new()
            .page(0, 500)
            .time_extend(0, 0, 0)
            .build_header();

        let section = &header.cpu_sections()[0];
        let mut iter = PageIterator::new(&header, &section.pages[0], 0);
        assert!(!iter.read_next_event().unwrap());
        assert_eq!(iter.current_timestamp(), 500);
    }

    #[test]
    fn custom_length_test() {
        // A record with the custom-length sentinel and a length word of 12
        // has a payload of exactly 8 bytes.
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&7u32.to_le_bytes());
        assert_eq!(payload.len(), 8);

        let header = TraceBuilder::new()
            .page(0, 100)
            .custom_len_event(0, 3, 12, &payload)
            .build_header();

        let section = &header.cpu_sections()[0];
        let mut iter = PageIterator::new(&header, &section.pages[0], 0);
        assert!(iter.read_next_event().unwrap());
        let def = iter.event_def().unwrap();
        assert_eq!(def.payload_size, 8);
        assert_eq!(iter.current_timestamp(), 103);
    }

    #[test]
    fn timestamp_records_test() {
        let header = TraceBuilder::new()
            .page(0, 1000)
            // Absolute timestamp record resets the running timestamp.
            .time_stamp(0, 5000)
            .event(0, 1, 1, &1u32.to_le_bytes())
            // Extended timestamp adds a large delta.
            .time_extend(0, 2, 1)
            .event(0, 0, 1, &2u32.to_le_bytes())
            .build_header();

        let section = &header.cpu_sections()[0];
        let mut iter = PageIterator::new(&header, &section.pages[0], 0);

        assert!(iter.read_next_event().unwrap());
        assert_eq!(iter.current_timestamp(), 5001);

        assert!(iter.read_next_event().unwrap());
        // 5001 + (1 << 27) + 2
        assert_eq!(iter.current_timestamp(), 5001 + (1 << 27) + 2);

        assert!(!iter.read_next_event().unwrap());
    }

    #[test]
    fn page_seek_test() {
        let header = TraceBuilder::new()
            .page(0, 1000)
            .event(0, 10, 1, &1u32.to_le_bytes())
            .event(0, 10, 1, &2u32.to_le_bytes())
            .event(0, 10, 1, &3u32.to_le_bytes())
            .build_header();

        let section = &header.cpu_sections()[0];
        let mut iter = PageIterator::new(&header, &section.pages[0], 0);

        assert!(iter.seek(1020).unwrap());
        assert_eq!(iter.current_timestamp(), 1020);
        let event = iter.current_event().unwrap().unwrap();
        assert_eq!(event.field("value"), Some(&Value::U64Scalar(2)));

        // Target below the first event lands on the first event.
        assert!(iter.seek(0).unwrap());
        assert_eq!(iter.current_timestamp(), 1010);

        // Target past the last event reports a miss.
        assert!(!iter.seek(99999).unwrap());
        assert_eq!(iter.current_event().unwrap(), None);
    }

    #[test]
    fn section_page_chain_test() {
        let header = TraceBuilder::new()
            .page(0, 1000)
            .event(0, 1, 1, &1u32.to_le_bytes())
            .page(0, 2000)
            .event(0, 1, 1, &2u32.to_le_bytes())
            .event(0, 1, 1, &3u32.to_le_bytes())
            .build_header();

        let section = &header.cpu_sections()[0];
        assert_eq!(section.pages.len(), 2);
        assert_eq!(section.pages[0].next, Some(1));
        assert_eq!(section.pages[1].next, None);

        let mut iter = CpuSectionIterator::new(&header, section);
        let mut timestamps = Vec::new();
        while iter.read_next_event().unwrap() {
            timestamps.push(iter.current_timestamp());
        }
        assert_eq!(timestamps, vec![1001, 2001, 2002]);
    }

    #[test]
    fn section_seek_test() {
        let header = TraceBuilder::new()
            .page(0, 1000)
            .event(0, 1, 1, &1u32.to_le_bytes())
            .page(0, 2000)
            .event(0, 1, 1, &2u32.to_le_bytes())
            .build_header();

        let section = &header.cpu_sections()[0];
        let mut iter = CpuSectionIterator::new(&header, section);

        // A seek target exactly on a page boundary selects the later page,
        // since the earlier page's events are all below it.
        assert!(iter.seek(2000).unwrap());
        let event = iter.current_event().unwrap().unwrap();
        assert_eq!(event.field("value"), Some(&Value::U64Scalar(2)));

        // Seeking into the first page's range stays there.
        assert!(iter.seek(1001).unwrap());
        let event = iter.current_event().unwrap().unwrap();
        assert_eq!(event.field("value"), Some(&Value::U64Scalar(1)));

        // Seek miss past the end of the section.
        assert!(!iter.seek(99999).unwrap());
        assert!(!iter.has_current_event());
    }
}
