#![no_main]

use libfuzzer_sys::fuzz_target;
use std::rc::Rc;
use ts_section_demux::demultiplex::{InvalidSection, SectionDemux};
use ts_section_demux::packet::Pid;
use ts_section_demux::psi::table::Table;
use ts_section_demux::psi::Section;

fuzz_target!(|data: &[u8]| {
    let mut demux = SectionDemux::new();
    demux.set_pid_filter([0x00, 0x01, 0x10, 0x11, 0x12, 0x14].iter().map(|&p| Pid::new(p)));
    demux.set_current_next(true, true);
    demux.track_invalid_section_versions(true);
    demux.set_table_handler(Some(Box::new(|_: &mut SectionDemux, t: &Table| {
        assert!(t.section_count() > 0);
    })));
    demux.set_section_handler(Some(Box::new(|_: &mut SectionDemux, s: &Rc<Section>| {
        assert!(s.len() >= 3);
    })));
    demux.set_invalid_section_handler(Some(Box::new(
        |demux: &mut SectionDemux, s: &InvalidSection| {
            // exercise the deferred reset path
            demux.reset_pid(s.pid());
        },
    )));
    let _ = demux.push(data);
    demux.flush_all(true, true);
});
