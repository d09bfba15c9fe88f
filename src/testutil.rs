//! Test-only builder for synthetic trace.dat v6 files.
//!
//! Builds a complete file in memory: the header text blocks, a couple of
//! event formats, an options section and per-CPU flyrecord sections with
//! hand-packed record headers.

use std::io::Write as _;

use crate::{
    header::{FileOffset, Header, HeaderError, Timestamp},
    io::FileMapping,
};

const PAGE_SIZE: u32 = 256;
const PAGE_HEADER_SIZE: usize = 16;

fn fmt_block(name: &str, id: u16, custom_fields: &str, print_fmt: &str) -> String {
    format!(
        "name: {name}\nID: {id}\nformat:\n\
         \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
         \tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
         \tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
         \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
         \n{custom_fields}\nprint fmt: {print_fmt}\n"
    )
}

struct PageSpec {
    timestamp: Timestamp,
    data: Vec<u8>,
}

pub(crate) struct TraceBuilder {
    nr_cpus: u32,
    pages: Vec<Vec<PageSpec>>,
    printk: Vec<(u64, String)>,
    kallsyms: Vec<(u64, String)>,
    comms: Vec<(u32, String)>,
    latency: bool,
}

impl TraceBuilder {
    pub(crate) fn new() -> Self {
        TraceBuilder {
            nr_cpus: 1,
            pages: vec![Vec::new()],
            printk: Vec::new(),
            kallsyms: vec![(0x1000, "start_kernel".into()), (0x2000, "do_idle".into())],
            comms: vec![(100, "testproc".into())],
            latency: false,
        }
    }

    pub(crate) fn cpus(mut self, nr_cpus: u32) -> Self {
        self.nr_cpus = nr_cpus;
        self.pages = (0..nr_cpus).map(|_| Vec::new()).collect();
        self
    }

    pub(crate) fn latency(mut self) -> Self {
        self.latency = true;
        self
    }

    pub(crate) fn printk(mut self, addr: u64, s: &str) -> Self {
        self.printk.push((addr, s.into()));
        self
    }

    /// Start a new page for `cpu` with the given header timestamp.
    pub(crate) fn page(mut self, cpu: usize, timestamp: Timestamp) -> Self {
        self.pages[cpu].push(PageSpec {
            timestamp,
            data: Vec::new(),
        });
        self
    }

    fn data(&mut self, cpu: usize) -> &mut Vec<u8> {
        &mut self
            .pages[cpu]
            .last_mut()
            .expect("start a page before adding records")
            .data
    }

    /// Append a data record: 8 bytes of common fields (type = `id`,
    /// pid = 100) followed by `tail`. The total payload size must be a
    /// multiple of 4.
    pub(crate) fn event(mut self, cpu: usize, delta: u32, id: u16, tail: &[u8]) -> Self {
        let payload_size = 8 + tail.len();
        assert!(payload_size % 4 == 0);
        let type_len = (payload_size / 4) as u32;

        let data = self.data(cpu);
        data.extend_from_slice(&(type_len | (delta << 5)).to_le_bytes());
        data.extend_from_slice(&id.to_le_bytes());
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(&100i32.to_le_bytes());
        data.extend_from_slice(tail);
        self
    }

    /// Append a record using the custom-length sentinel: the header word is
    /// followed by an explicit length word.
    pub(crate) fn custom_len_event(
        mut self,
        cpu: usize,
        delta: u32,
        len_word: u32,
        payload: &[u8],
    ) -> Self {
        let data = self.data(cpu);
        data.extend_from_slice(&(delta << 5).to_le_bytes());
        data.extend_from_slice(&len_word.to_le_bytes());
        data.extend_from_slice(payload);
        self
    }

    /// Append an extended-timestamp record.
    pub(crate) fn time_extend(mut self, cpu: usize, delta: u32, extend: u32) -> Self {
        let data = self.data(cpu);
        data.extend_from_slice(&(30 | (delta << 5)).to_le_bytes());
        data.extend_from_slice(&extend.to_le_bytes());
        self
    }

    /// Append an absolute-timestamp record setting the running timestamp to
    /// `timestamp`.
    pub(crate) fn time_stamp(mut self, cpu: usize, timestamp: Timestamp) -> Self {
        let delta = (timestamp & ((1 << 27) - 1)) as u32;
        let extend = (timestamp >> 27) as u32;
        let data = self.data(cpu);
        data.extend_from_slice(&(31 | (delta << 5)).to_le_bytes());
        data.extend_from_slice(&extend.to_le_bytes());
        self
    }

    pub(crate) fn build_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"\x17\x08\x44tracing");
        out.extend_from_slice(b"6\0");
        out.push(0); // little endian
        out.push(8); // long size
        out.extend_from_slice(&PAGE_SIZE.to_le_bytes());

        out.extend_from_slice(b"header_page\0");
        let header_page = "\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;\n\
             \tfield: local_t commit;\toffset:8;\tsize:8;\tsigned:1;\n\
             \tfield: char data;\toffset:16;\tsize:4080;\tsigned:0;\n";
        out.extend_from_slice(&(header_page.len() as u64).to_le_bytes());
        out.extend_from_slice(header_page.as_bytes());

        out.extend_from_slice(b"header_event\0");
        let header_event = "# compressed entry header\n\
             \ttype_len    :    5 bits\n\
             \ttime_delta  :   27 bits\n\
             \tarray       :   32 bits\n\
             \n\
             \tpadding     : type == 29\n\
             \ttime_extend : type == 30\n\
             \ttime_stamp : type == 31\n\
             \tdata max type_len  == 28\n";
        out.extend_from_slice(&(header_event.len() as u64).to_le_bytes());
        out.extend_from_slice(header_event.as_bytes());

        let events = [
            fmt_block(
                "tick",
                1,
                "\tfield:unsigned int value;\toffset:8;\tsize:4;\tsigned:0;\n",
                "\"value=%u\", REC->value",
            ),
            fmt_block(
                "stamp",
                2,
                "\tfield:unsigned long big;\toffset:8;\tsize:8;\tsigned:0;\n",
                "\"big=%lu\", REC->big",
            ),
            fmt_block(
                "log",
                3,
                "\tfield:char comm[16];\toffset:8;\tsize:16;\tsigned:0;\n\
                 \tfield:__data_loc char[] msg;\toffset:24;\tsize:4;\tsigned:0;\n",
                "\"%s: %s\", REC->comm, __get_str(msg)",
            ),
        ];
        out.extend_from_slice(&(events.len() as u32).to_le_bytes());
        for block in &events {
            out.extend_from_slice(&(block.len() as u64).to_le_bytes());
            out.extend_from_slice(block.as_bytes());
        }

        let syscalls = [
            fmt_block(
                "sys_enter",
                5,
                "\tfield:long id;\toffset:8;\tsize:8;\tsigned:1;\n",
                "\"NR %ld\", REC->id",
            ),
            fmt_block(
                "sys_exit",
                6,
                "\tfield:long id;\toffset:8;\tsize:8;\tsigned:1;\n",
                "\"NR %ld\", REC->id",
            ),
        ];
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(b"raw_syscalls\0");
        out.extend_from_slice(&(syscalls.len() as u32).to_le_bytes());
        for block in &syscalls {
            out.extend_from_slice(&(block.len() as u64).to_le_bytes());
            out.extend_from_slice(block.as_bytes());
        }

        let kallsyms: String = self
            .kallsyms
            .iter()
            .map(|(addr, name)| format!("{addr:016x} T {name}\n"))
            .collect();
        out.extend_from_slice(&(kallsyms.len() as u32).to_le_bytes());
        out.extend_from_slice(kallsyms.as_bytes());

        let printk: String = self
            .printk
            .iter()
            .map(|(addr, s)| format!("0x{addr:x} : \"{s}\"\n"))
            .collect();
        out.extend_from_slice(&(printk.len() as u32).to_le_bytes());
        out.extend_from_slice(printk.as_bytes());

        let comms: String = self
            .comms
            .iter()
            .map(|(pid, comm)| format!("{pid} {comm}\n"))
            .collect();
        out.extend_from_slice(&(comms.len() as u64).to_le_bytes());
        out.extend_from_slice(comms.as_bytes());

        out.extend_from_slice(&self.nr_cpus.to_le_bytes());

        // Options section with a single DATE option.
        out.extend_from_slice(b"options  \0");
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&5u32.to_le_bytes());
        out.extend_from_slice(b"2024\0");
        out.extend_from_slice(&0u16.to_le_bytes());

        if self.latency {
            out.extend_from_slice(b"latency  \0");
            return out;
        }

        out.extend_from_slice(b"flyrecord\0");
        let locations_at = out.len();
        out.resize(out.len() + 16 * self.nr_cpus as usize, 0);

        for (cpu, pages) in self.pages.iter().enumerate() {
            let offset = out.len() as u64;
            let size = (pages.len() * PAGE_SIZE as usize) as u64;
            let entry = locations_at + 16 * cpu;
            out[entry..(entry + 8)].copy_from_slice(&offset.to_le_bytes());
            out[(entry + 8)..(entry + 16)].copy_from_slice(&size.to_le_bytes());

            for page in pages {
                assert!(page.data.len() <= PAGE_SIZE as usize - PAGE_HEADER_SIZE);
                out.extend_from_slice(&page.timestamp.to_le_bytes());
                out.extend_from_slice(&(page.data.len() as u64).to_le_bytes());
                out.extend_from_slice(&page.data);
                out.resize(
                    out.len() + (PAGE_SIZE as usize - PAGE_HEADER_SIZE - page.data.len()),
                    0,
                );
            }
        }
        out
    }

    pub(crate) fn build_header(&self) -> Header {
        header_from_bytes(&self.build_bytes()).expect("Could not parse synthetic trace")
    }
}

pub(crate) fn header_from_bytes(bytes: &[u8]) -> Result<Header, HeaderError> {
    let mut file = tempfile::NamedTempFile::new().expect("Could not create temp file");
    file.write_all(bytes).expect("Could not write temp file");
    file.flush().expect("Could not flush temp file");
    // The mapping stays valid after the temp file is unlinked on drop.
    let mapping = unsafe { FileMapping::open(file.path()) }.expect("Could not map temp file");
    Header::parse(mapping)
}

/// Offset of the first occurrence of `needle` in `bytes`.
pub(crate) fn offset_of(bytes: &[u8], needle: &[u8]) -> FileOffset {
    bytes
        .windows(needle.len())
        .position(|window| window == needle)
        .expect("needle not found") as FileOffset
}
