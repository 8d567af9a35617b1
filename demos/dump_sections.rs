use hex_slice::AsHex;
use std::env;
use std::fs::File;
use std::io;
use std::rc::Rc;
use ts_section_demux::demultiplex::{InvalidSection, SectionDemux};
use ts_section_demux::packet::{Packet, Pid};
use ts_section_demux::psi::table::Table;
use ts_section_demux::psi::Section;

/// PAT, CAT, NIT, SDT/BAT, EIT and TDT/TOT
const DEFAULT_PIDS: [u16; 6] = [0x00, 0x01, 0x10, 0x11, 0x12, 0x14];

fn create_demux(pids: Vec<Pid>) -> SectionDemux {
    let mut demux = SectionDemux::new();
    demux.set_pid_filter(pids);
    demux.track_invalid_section_versions(true);
    demux.set_table_handler(Some(Box::new(|_: &mut SectionDemux, table: &Table| {
        println!(
            "{:?} {} version {}: {} sections, {} bytes",
            table.pid(),
            table.identity(),
            table.version(),
            table.section_count(),
            table.total_size()
        );
    })));
    demux.set_section_handler(Some(Box::new(
        |_: &mut SectionDemux, section: &Rc<Section>| {
            println!(
                "  {:?} table_id={:#04x} section {}/{} packets {}..={}: {:02x}",
                section.source_pid(),
                section.table_id(),
                section.section_number(),
                section.last_section_number(),
                section.first_packet_index(),
                section.last_packet_index(),
                section.payload().as_hex()
            );
        },
    )));
    demux.set_invalid_section_handler(Some(Box::new(
        |_: &mut SectionDemux, section: &InvalidSection| {
            println!(
                "  {:?} invalid section ({}) packets {}..={}: {:02x}",
                section.pid(),
                section.reason(),
                section.first_packet_index(),
                section.last_packet_index(),
                section.data().as_hex()
            );
        },
    )));
    demux
}

fn run<R>(mut r: R, demux: &mut SectionDemux) -> io::Result<()>
where
    R: io::Read,
{
    let mut buf = vec![0u8; Packet::SIZE * 1024];
    let mut filled = 0;
    loop {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => {
                filled += n;
                let whole = filled - filled % Packet::SIZE;
                // only whole packets are pushed, so this can't fail
                let _ = demux.push(&buf[..whole]);
                buf.copy_within(whole..filled, 0);
                filled -= whole;
            }
        }
    }
    if filled > 0 {
        eprintln!("ignoring {} trailing bytes", filled);
    }
    demux.flush_all(true, true);
    Ok(())
}

fn parse_pid(arg: &str) -> Pid {
    let value = match arg.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    let value = value.unwrap_or_else(|_| panic!("invalid PID: {}", arg));
    assert!(value < 0x2000, "PID out of range: {}", arg);
    Pid::new(value)
}

fn main() {
    env_logger::init();
    let mut args = env::args();
    args.next();
    let name = args.next().expect("usage: dump_sections <file.ts> [pid...]");
    let mut pids: Vec<Pid> = args.map(|a| parse_pid(&a)).collect();
    if pids.is_empty() {
        pids = DEFAULT_PIDS.iter().map(|&p| Pid::new(p)).collect();
    }
    let mut demux = create_demux(pids);
    let f = File::open(&name).unwrap_or_else(|_| panic!("file not found: {}", &name));
    run(f, &mut demux).unwrap_or_else(|_| panic!("error reading {}", &name));

    println!("{} packets", demux.packet_count());
    if demux.status().has_errors() {
        print!("{}", demux.status().display_errors());
    }
}
