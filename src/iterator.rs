//! Time-ordered merging of the per-CPU streams.
//!
//! [MergingReader] owns one [CpuSectionIterator] per CPU section and merges
//! them with a priority structure keyed by each stream's next timestamp.
//! [TraceIterator] is the public cursor on top of it: it tracks a rank and a
//! [Location] for checkpoint/restore, converts decoded events into
//! [TraceEvent] and transparently skips the raw syscall bookkeeping events.

use core::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::{
    buffer::{BufferError, CpuSectionIterator, Event, Value},
    header::{Cpu, Header, Identifier, Timestamp},
};

/// Merges all the CPU section streams of a trace into one stream ordered by
/// non-decreasing timestamp.
///
/// Streams with equal current timestamps come out ordered by section index.
/// That is an implementation artifact, not a guarantee: only the relative
/// order of events within one CPU is guaranteed.
pub struct MergingReader<'h> {
    iterators: Vec<CpuSectionIterator<'h>>,
    heap: BinaryHeap<Reverse<(Timestamp, usize)>>,
    start_time: Timestamp,
    end_time: Timestamp,
}

impl<'h> MergingReader<'h> {
    /// Build one iterator per CPU section, prime each with its first event
    /// and insert the non-empty ones into the priority structure.
    pub fn new(header: &'h Header) -> Result<Self, BufferError> {
        let mut iterators: Vec<CpuSectionIterator<'h>> = header
            .cpu_sections()
            .iter()
            .map(|section| CpuSectionIterator::new(header, section))
            .collect();

        if iterators.is_empty() {
            return Err(BufferError::NoRingBuffer);
        }

        let mut heap = BinaryHeap::with_capacity(iterators.len());
        for (idx, iter) in iterators.iter_mut().enumerate() {
            match iter.read_next_event() {
                Ok(true) => heap.push(Reverse((iter.current_timestamp(), idx))),
                Ok(false) => (),
                Err(err) => {
                    tracing::warn!(cpu = iter.cpu(), error = %err, "could not read first event of CPU stream");
                }
            }
        }

        let start_time = heap.peek().map(|Reverse((ts, _))| *ts).unwrap_or(0);
        Ok(MergingReader {
            iterators,
            heap,
            start_time,
            end_time: start_time,
        })
    }

    /// Whether any stream still has events.
    #[inline]
    pub fn has_more(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Timestamp of the first event of the trace.
    #[inline]
    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Largest timestamp seen so far. This is not necessarily the last
    /// event of the trace, just the last one read so far.
    #[inline]
    pub fn end_time(&self) -> Timestamp {
        self.end_time
    }

    /// Timestamp of the earliest pending event across all streams.
    #[inline]
    pub fn current_timestamp(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse((ts, _))| *ts)
    }

    /// CPU of the earliest pending event across all streams.
    #[inline]
    pub fn current_cpu(&self) -> Option<Cpu> {
        self.current().map(|iter| iter.cpu())
    }

    fn current(&self) -> Option<&CpuSectionIterator<'h>> {
        self.heap
            .peek()
            .map(|Reverse((_, idx))| &self.iterators[*idx])
    }

    /// Materialize the earliest pending event.
    pub fn current_event(&self) -> Result<Option<Event>, BufferError> {
        match self.current() {
            Some(iter) => iter.current_event(),
            None => Ok(None),
        }
    }

    /// Pop the earliest stream, read its next event and reinsert it.
    /// Returns whether any stream remains.
    ///
    /// An I/O failure on a stream drops that stream only; the other CPUs
    /// keep going.
    pub fn advance(&mut self) -> bool {
        let Some(Reverse((_, idx))) = self.heap.pop() else {
            return false;
        };

        let iter = &mut self.iterators[idx];
        match iter.read_next_event() {
            Ok(true) => {
                let ts = iter.current_timestamp();
                self.heap.push(Reverse((ts, idx)));
                self.end_time = self.end_time.max(ts);
            }
            Ok(false) => (),
            Err(err) => {
                tracing::warn!(cpu = iter.cpu(), error = %err, "dropping CPU stream after read failure");
            }
        }

        self.has_more()
    }

    /// Seek every stream to `target` independently and rebuild the priority
    /// structure from the streams that still have a current event.
    pub fn seek(&mut self, target: Timestamp) -> bool {
        self.heap.clear();

        let mut floor: Option<Timestamp> = None;
        for (idx, iter) in self.iterators.iter_mut().enumerate() {
            if let Err(err) = iter.seek(target) {
                tracing::warn!(cpu = iter.cpu(), error = %err, "dropping CPU stream after seek failure");
                continue;
            }
            if iter.has_current_event() {
                let ts = iter.current_timestamp();
                self.heap.push(Reverse((ts, idx)));
                floor = Some(floor.map_or(ts, |f| f.min(ts)));
            }
        }

        if let Some(floor) = floor {
            self.end_time = self.end_time.max(floor);
        }
        self.has_more()
    }
}

/// Position of a [TraceIterator], usable as a checkpoint.
///
/// The index is the count of prior events sharing the exact same timestamp
/// since the last seek, not a stable per-record identifier: if two decode
/// passes skip a different number of unresolvable records at that timestamp,
/// the same Location can address a different event. It is a session-scoped
/// checkpoint, not a durable bookmark format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub timestamp: Timestamp,
    /// Tie-break among events sharing `timestamp`.
    pub index: u64,
}

/// A decoded event in the shape consumed by trace analyses.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    /// Event name, after syscall rewrites.
    pub name: String,
    pub cpu: Cpu,
    /// Absolute timestamp in nanoseconds.
    pub timestamp: Timestamp,
    pub pid: i64,
    pub tid: i64,
    /// Non-common fields only.
    pub fields: Vec<(Identifier, Value)>,
}

impl TraceEvent {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

const RAW_SYSCALL_ENTER: &str = "sys_enter";
const RAW_SYSCALL_EXIT: &str = "sys_exit";
const SYSCALL_ENTER_PREFIX: &str = "sys_enter_";
const SYSCALL_EXIT_PREFIX: &str = "sys_exit_";
const SYSCALL_PREFIX: &str = "sys_";
const EXIT_SYSCALL: &str = "exit_syscall";
const SCHED_PROCESS_FORK: &str = "sched_process_fork";

/// Rewrite syscall event names to the form the syscall analyses expect.
fn rewrite_event_name(name: &str) -> String {
    if name.starts_with(SYSCALL_EXIT_PREFIX) {
        return EXIT_SYSCALL.into();
    }
    if let Some(stripped) = name.strip_prefix(SYSCALL_ENTER_PREFIX) {
        return format!("{SYSCALL_PREFIX}{stripped}");
    }
    name.into()
}

fn convert_event(event: Event) -> TraceEvent {
    let name = rewrite_event_name(&event.name);

    let mut pid: i64 = -1;
    if let Some(value) = event.field("common_pid") {
        if let Some(x) = value.as_i64() {
            pid = x;
        }
    }
    let tid = pid;

    if let Some(tgid) = event.field("tgid").and_then(Value::as_i64) {
        if tgid != pid {
            pid = tgid;
        }
    }

    let fields = event
        .fields
        .into_iter()
        .filter(|(key, _)| !key.starts_with("common_"))
        .map(|(key, value)| {
            if key == "parent_pid" && name == SCHED_PROCESS_FORK {
                ("pid".into(), value)
            } else {
                (key, value)
            }
        })
        .collect();

    TraceEvent {
        name,
        cpu: event.cpu,
        timestamp: event.timestamp,
        pid,
        tid,
        fields,
    }
}

/// Public cursor over a whole trace.
pub struct TraceIterator<'h> {
    reader: MergingReader<'h>,
    rank: u64,
    location: Option<Location>,
    prev_location: Option<Location>,
    prev_event: Option<TraceEvent>,
}

impl<'h> TraceIterator<'h> {
    /// Build an iterator initially pointing at the first event of the trace,
    /// skipping the synthetic bootstrap events present at the start of most
    /// traces.
    pub fn new(header: &'h Header) -> Result<Self, BufferError> {
        let reader = MergingReader::new(header)?;
        let mut iter = TraceIterator {
            reader,
            rank: 0,
            location: None,
            prev_location: None,
            prev_event: None,
        };

        if iter.reader.has_more() {
            iter.location = iter
                .reader
                .current_timestamp()
                .map(|timestamp| Location {
                    timestamp,
                    index: 0,
                });
            iter.skip_raw_syscall_events()?;
        }
        Ok(iter)
    }

    /// Ordinal position in the merged stream, counting every advance.
    #[inline]
    pub fn rank(&self) -> u64 {
        self.rank
    }

    /// Current position, [None] once the trace is exhausted.
    #[inline]
    pub fn location(&self) -> Option<Location> {
        self.location
    }

    #[inline]
    pub fn has_more(&self) -> bool {
        self.reader.has_more()
    }

    #[inline]
    pub fn start_time(&self) -> Timestamp {
        self.reader.start_time()
    }

    #[inline]
    pub fn end_time(&self) -> Timestamp {
        self.reader.end_time()
    }

    /// Timestamp of the current event.
    #[inline]
    pub fn current_timestamp(&self) -> Option<Timestamp> {
        self.reader.current_timestamp()
    }

    /// The event the iterator currently points to.
    ///
    /// The decoded event is cached: asking again without advancing returns
    /// the same event without re-decoding.
    pub fn current_event(&mut self) -> Result<Option<&TraceEvent>, BufferError> {
        if self.location.is_none() {
            return Ok(None);
        }
        if self.location != self.prev_location {
            if let Some(event) = self.reader.current_event()? {
                self.prev_event = Some(convert_event(event));
                self.prev_location = self.location;
            }
        }
        Ok(self.prev_event.as_ref())
    }

    /// Advance the merged stream by one record and update the location:
    /// same timestamp increments the tie-break index, a new timestamp resets
    /// it.
    fn advance_raw(&mut self) -> bool {
        let has_more = self.reader.advance();
        if has_more {
            let timestamp = self.reader.current_timestamp().unwrap_or(0);
            self.location = Some(match self.location {
                Some(loc) if loc.timestamp == timestamp => Location {
                    timestamp,
                    index: loc.index + 1,
                },
                _ => Location {
                    timestamp,
                    index: 0,
                },
            });
        } else {
            self.location = None;
        }
        has_more
    }

    /// Skip the raw syscall bookkeeping events so the cursor always points
    /// at an event analyses care about.
    fn skip_raw_syscall_events(&mut self) -> Result<bool, BufferError> {
        loop {
            match self.reader.current_event()? {
                Some(event)
                    if event.name == RAW_SYSCALL_ENTER || event.name == RAW_SYSCALL_EXIT =>
                {
                    if !self.advance_raw() {
                        return Ok(false);
                    }
                }
                _ => return Ok(true),
            }
        }
    }

    /// Move to the next event. Returns whether an event is available.
    pub fn advance(&mut self) -> Result<bool, BufferError> {
        if !self.advance_raw() {
            return Ok(false);
        }
        self.rank += 1;
        self.skip_raw_syscall_events()
    }

    /// Seek to the first event whose timestamp is at least `timestamp`.
    pub fn seek(&mut self, timestamp: Timestamp) -> Result<bool, BufferError> {
        let found = self.reader.seek(timestamp);
        self.location = self.reader.current_timestamp().map(|timestamp| Location {
            timestamp,
            index: 0,
        });
        let skipped = self.skip_raw_syscall_events()?;
        Ok(found && skipped)
    }

    /// Seek to a [Location] previously returned by [TraceIterator::location].
    ///
    /// After the timestamp seek, the iterator advances past up to
    /// `location.index` events sharing that timestamp to land on the same
    /// tie-break position.
    pub fn seek_location(&mut self, location: &Location) -> Result<bool, BufferError> {
        if Some(*location) == self.location {
            return Ok(self.reader.has_more());
        }

        let mut found = self.seek(location.timestamp)?;

        let mut index = 0;
        while index < location.index {
            match self.current_timestamp() {
                Some(ts) if ts <= location.timestamp => {
                    index += 1;
                }
                _ => {
                    index = 0;
                    break;
                }
            }
            if !self.advance()? {
                found = false;
                break;
            }
        }

        match self.current_timestamp() {
            Some(ts) => {
                self.location = Some(Location {
                    timestamp: ts,
                    index: if ts == location.timestamp { index } else { 0 },
                });
            }
            None => {
                self.location = None;
                found = false;
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{buffer::Value, testutil::TraceBuilder};

    fn two_cpu_header() -> crate::header::Header {
        TraceBuilder::new()
            .cpus(2)
            .page(0, 100)
            .event(0, 0, 1, &10u32.to_le_bytes())
            .event(0, 50, 1, &11u32.to_le_bytes())
            .page(1, 50)
            .event(1, 0, 1, &20u32.to_le_bytes())
            .event(1, 10, 1, &21u32.to_le_bytes())
            .build_header()
    }

    #[test]
    fn merge_order_test() {
        let header = two_cpu_header();
        let mut reader = MergingReader::new(&header).unwrap();

        // CPU1's first record has the earliest timestamp, so the merged
        // stream starts with it.
        assert_eq!(reader.start_time(), 50);
        let mut seen = Vec::new();
        loop {
            let event = reader.current_event().unwrap().unwrap();
            seen.push((event.cpu, event.timestamp));
            if !reader.advance() {
                break;
            }
        }
        assert_eq!(seen, vec![(1, 50), (1, 60), (0, 100), (0, 150)]);
        assert_eq!(reader.end_time(), 150);
    }

    #[test]
    fn merge_seek_test() {
        let header = two_cpu_header();
        let mut reader = MergingReader::new(&header).unwrap();

        assert!(reader.seek(60));
        assert_eq!(reader.current_timestamp(), Some(60));
        let event = reader.current_event().unwrap().unwrap();
        assert_eq!(event.cpu, 1);

        // Both CPUs still contribute their remaining events.
        assert!(reader.advance());
        assert_eq!(reader.current_timestamp(), Some(100));

        // Seeking past every event leaves an empty reader.
        assert!(!reader.seek(99999));
        assert_eq!(reader.current_event().unwrap(), None);
    }

    #[test]
    fn latency_has_no_ring_buffer_test() {
        let header = TraceBuilder::new().latency().build_header();
        assert!(matches!(
            MergingReader::new(&header),
            Err(BufferError::NoRingBuffer)
        ));
    }

    #[test]
    fn iterator_order_and_rank_test() {
        let header = two_cpu_header();
        let mut iter = TraceIterator::new(&header).unwrap();

        let mut seen = Vec::new();
        loop {
            let event = iter.current_event().unwrap().unwrap().clone();
            seen.push((event.cpu, event.timestamp));
            if !iter.advance().unwrap() {
                break;
            }
        }
        assert_eq!(seen, vec![(1, 50), (1, 60), (0, 100), (0, 150)]);
        assert_eq!(iter.rank(), 3);
    }

    #[test]
    fn current_event_is_cached_test() {
        let header = two_cpu_header();
        let mut iter = TraceIterator::new(&header).unwrap();

        let first = iter.current_event().unwrap().unwrap() as *const TraceEvent;
        let second = iter.current_event().unwrap().unwrap() as *const TraceEvent;
        assert_eq!(first, second);
    }

    #[test]
    fn location_round_trip_test() {
        // Two events share timestamp 100 on different CPUs.
        let header = TraceBuilder::new()
            .cpus(2)
            .page(0, 100)
            .event(0, 0, 1, &1u32.to_le_bytes())
            .event(0, 5, 1, &2u32.to_le_bytes())
            .page(1, 100)
            .event(1, 0, 1, &3u32.to_le_bytes())
            .build_header();

        let mut iter = TraceIterator::new(&header).unwrap();

        let mut snapshots = Vec::new();
        loop {
            let location = iter.location().unwrap();
            let event = iter.current_event().unwrap().unwrap().clone();
            snapshots.push((location, event));
            if !iter.advance().unwrap() {
                break;
            }
        }
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].0, Location { timestamp: 100, index: 0 });
        assert_eq!(snapshots[1].0, Location { timestamp: 100, index: 1 });
        assert_eq!(snapshots[2].0, Location { timestamp: 105, index: 0 });

        // Re-seeking to every previously observed location reproduces the
        // same decoded event.
        for (location, expected) in &snapshots {
            let mut iter = TraceIterator::new(&header).unwrap();
            assert!(iter.seek_location(location).unwrap());
            let event = iter.current_event().unwrap().unwrap();
            assert_eq!(event, expected);
        }
    }

    #[test]
    fn raw_syscall_skip_test() {
        // The trace opens with raw sys_enter/sys_exit bookkeeping events,
        // which the iterator skips transparently.
        let header = TraceBuilder::new()
            .page(0, 10)
            .event(0, 0, 5, &7u64.to_le_bytes())
            .event(0, 1, 6, &7u64.to_le_bytes())
            .event(0, 1, 1, &42u32.to_le_bytes())
            .build_header();

        let mut iter = TraceIterator::new(&header).unwrap();
        let event = iter.current_event().unwrap().unwrap();
        assert_eq!(event.name, "tick");
        assert_eq!(event.field("value"), Some(&Value::U64Scalar(42)));

        assert!(!iter.advance().unwrap());
    }

    #[test]
    fn syscall_rewrite_test() {
        assert_eq!(rewrite_event_name("sys_exit_recvmsg"), "exit_syscall");
        assert_eq!(rewrite_event_name("sys_enter_recvmsg"), "sys_recvmsg");
        assert_eq!(rewrite_event_name("sched_switch"), "sched_switch");
    }

    #[test]
    fn trace_event_conversion_test() {
        let event = Event {
            timestamp: 42,
            cpu: 1,
            name: "sched_process_fork".into(),
            fields: vec![
                ("common_type".into(), Value::U64Scalar(7)),
                ("common_pid".into(), Value::I64Scalar(1216)),
                ("parent_pid".into(), Value::I64Scalar(1216)),
                ("child_pid".into(), Value::I64Scalar(1300)),
            ],
        };
        let event = convert_event(event);
        assert_eq!(event.pid, 1216);
        assert_eq!(event.tid, 1216);
        // Common fields are stripped, parent_pid is renamed for fork events.
        assert_eq!(
            event.fields,
            vec![
                ("pid".into(), Value::I64Scalar(1216)),
                ("child_pid".into(), Value::I64Scalar(1300)),
            ]
        );
    }
}
