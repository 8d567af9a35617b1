use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use std::rc::Rc;
use ts_section_demux::demultiplex::{InvalidSection, SectionDemux};
use ts_section_demux::packet::Pid;
use ts_section_demux::psi::table::Table;
use ts_section_demux::psi::{CurrentNext, Section};

const EIT_PID: u16 = 0x12;
const TDT_PID: u16 = 0x14;

struct Packetizer {
    pid: u16,
    cc: u8,
}

impl Packetizer {
    /// Each section starts a new packet, with stuffing at the end of the last packet.
    fn put(&mut self, section: &[u8], out: &mut Vec<u8>) {
        let mut data = vec![0u8]; // pointer_field
        data.extend_from_slice(section);
        for (i, chunk) in data.chunks(184).enumerate() {
            out.push(0x47);
            out.push(if i == 0 { 0x40 } else { 0 } | (self.pid >> 8) as u8);
            out.push(self.pid as u8);
            out.push(0x10 | self.cc);
            self.cc = (self.cc + 1) & 0xf;
            out.extend_from_slice(chunk);
            out.resize(out.len() + 184 - chunk.len(), 0xff);
        }
    }
}

/// A stream of 8-section EIT-like tables, changing version every repetition, interleaved with
/// short sections on another PID.
fn synthetic_stream(size: usize) -> Vec<u8> {
    let mut eit = Packetizer { pid: EIT_PID, cc: 0 };
    let mut tdt = Packetizer { pid: TDT_PID, cc: 0 };
    let mut out = Vec::with_capacity(size + 188 * 40);
    let mut version = 0u8;
    while out.len() < size {
        for sn in 0..8u8 {
            let payload = vec![sn; 600];
            let sect = Section::new_long(
                0x50,
                true,
                0x0101,
                version,
                CurrentNext::Current,
                sn,
                7,
                &payload,
                Pid::new(EIT_PID),
            )
            .unwrap();
            eit.put(sect.content(), &mut out);
        }
        tdt.put(&[0x70, 0x70, 0x05, 0xe7, 0x3b, 0x12, 0x00, 0x00], &mut out);
        version = (version + 1) & 0x1f;
    }
    out
}

fn create_demux() -> SectionDemux {
    let mut demux = SectionDemux::new();
    demux.set_pid_filter(vec![Pid::new(EIT_PID), Pid::new(TDT_PID)]);
    demux.set_table_handler(Some(Box::new(|_: &mut SectionDemux, t: &Table| {
        black_box(t.section_count());
    })));
    demux.set_section_handler(Some(Box::new(|_: &mut SectionDemux, s: &Rc<Section>| {
        black_box(s.len());
    })));
    demux.set_invalid_section_handler(Some(Box::new(
        |_: &mut SectionDemux, s: &InvalidSection| {
            black_box(s.data().len());
        },
    )));
    demux
}

fn section_demux(c: &mut Criterion) {
    let buf = synthetic_stream(188 * 20_000);
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(buf.len() as u64));
    group.bench_function("section_demux", |b| {
        let mut demux = create_demux();
        b.iter(|| {
            demux.push(&buf[..]).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, section_demux);
criterion_main!(benches);
