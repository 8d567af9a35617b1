//! Completion of partially received DVB _Event Information Tables_ (_ETSI EN 300 468_).
//!
//! EIT schedule tables are commonly broadcast with sections missing on purpose (segments with no
//! events).  When asked to, the demultiplexer replaces any missing section of an EIT with an
//! empty one, so that the table can still be delivered.

use super::{CurrentNext, Section, TableIdentity};
use crate::packet::Pid;
use log::warn;
use std::rc::Rc;

pub const TID_EIT_PF_ACTUAL: u8 = 0x4e;
pub const TID_EIT_PF_OTHER: u8 = 0x4f;
pub const TID_EIT_SCHEDULE_ACTUAL_MIN: u8 = 0x50;
pub const TID_EIT_SCHEDULE_ACTUAL_MAX: u8 = 0x5f;
pub const TID_EIT_SCHEDULE_OTHER_MIN: u8 = 0x60;
pub const TID_EIT_SCHEDULE_OTHER_MAX: u8 = 0x6f;

/// `transport_stream_id`, `original_network_id`, `segment_last_section_number` and
/// `last_table_id`.
pub const EIT_PAYLOAD_FIXED_SIZE: usize = 6;
pub const SECTIONS_PER_SEGMENT: usize = 8;
pub const SEGMENTS_PER_TABLE: usize = 32;

/// Present/following EIT, actual or other TS.
pub fn is_eit_pf(table_id: u8) -> bool {
    table_id == TID_EIT_PF_ACTUAL || table_id == TID_EIT_PF_OTHER
}

pub fn is_eit_schedule(table_id: u8) -> bool {
    (TID_EIT_SCHEDULE_ACTUAL_MIN..=TID_EIT_SCHEDULE_ACTUAL_MAX).contains(&table_id)
        || (TID_EIT_SCHEDULE_OTHER_MIN..=TID_EIT_SCHEDULE_OTHER_MAX).contains(&table_id)
}

pub fn is_eit(table_id: u8) -> bool {
    is_eit_pf(table_id) || is_eit_schedule(table_id)
}

/// Replace every missing section in `slots` with an event-less section.
///
/// The fixed part of the payload is taken from the first present section, with
/// `segment_last_section_number` worked out per 8-section segment for schedule tables (or the
/// last section of the table for present/following tables), and `last_table_id` the highest
/// seen.  Tables which are not EITs, or which have no section at all, are left alone.
pub(crate) fn fill_missing(
    identity: TableIdentity,
    version: u8,
    pid: Pid,
    slots: &mut [Option<Rc<Section>>],
) {
    let tid = identity.table_id;
    if !is_eit(tid) || slots.is_empty() || slots.len() > SECTIONS_PER_SEGMENT * SEGMENTS_PER_TABLE
    {
        return;
    }
    let is_schedule = is_eit_schedule(tid);
    let is_actual = tid <= TID_EIT_SCHEDULE_ACTUAL_MAX;
    let last_section = (slots.len() - 1) as u8;
    let max_table_id = match (is_schedule, is_actual) {
        (true, true) => TID_EIT_SCHEDULE_ACTUAL_MAX,
        (true, false) => TID_EIT_SCHEDULE_OTHER_MAX,
        (false, _) => tid,
    };
    let mut last_table_id = tid;
    let mut empty_payload = [0u8; EIT_PAYLOAD_FIXED_SIZE];
    let mut template: Option<(bool, CurrentNext)> = None;

    let mut segment_last = [last_section; SEGMENTS_PER_TABLE];
    if is_schedule {
        for (i, last) in segment_last.iter_mut().enumerate() {
            *last = (i * SECTIONS_PER_SEGMENT) as u8;
        }
    }

    for (i, sect) in slots.iter().enumerate() {
        let sect = match sect {
            Some(s) if s.payload().len() >= EIT_PAYLOAD_FIXED_SIZE => s,
            _ => continue,
        };
        let payload = sect.payload();
        if template.is_none() {
            empty_payload.copy_from_slice(&payload[..EIT_PAYLOAD_FIXED_SIZE]);
            template = Some((sect.is_private(), sect.current_next()));
        }
        if is_schedule {
            last_table_id = max_table_id.min(payload[5].max(last_table_id));
            let seg = i / SECTIONS_PER_SEGMENT;
            let max_section = last_section.min(((seg + 1) * SECTIONS_PER_SEGMENT - 1) as u8);
            segment_last[seg] = max_section.min(segment_last[seg].max(payload[4]));
        }
    }
    empty_payload[5] = last_table_id;
    let (is_private, current_next) = template.unwrap_or((true, CurrentNext::Current));

    for (i, slot) in slots.iter_mut().enumerate() {
        if slot.is_some() {
            continue;
        }
        empty_payload[4] = segment_last[i / SECTIONS_PER_SEGMENT];
        match Section::new_long(
            tid,
            is_private,
            identity.table_id_extension,
            version,
            current_next,
            i as u8,
            last_section,
            &empty_payload,
            pid,
        ) {
            Ok(s) => *slot = Some(Rc::new(s)),
            Err(e) => warn!("{:?} {}: can't create empty EIT section: {}", pid, identity, e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::psi::test::long_section;
    use hex_literal::hex;

    fn eit_section(tid: u8, number: u8, last: u8, payload: &[u8]) -> Option<Rc<Section>> {
        Some(Rc::new(
            Section::new(
                long_section(tid, 0x0203, 7, number, last, payload),
                Pid::new(0x12),
            )
            .unwrap(),
        ))
    }

    #[test]
    fn present_following() {
        let mut slots = vec![
            eit_section(0x4e, 0, 1, &hex!("0001 0002 01 4e aabbcc")),
            None,
        ];
        fill_missing(TableIdentity::new(0x4e, 0x0203), 7, Pid::new(0x12), &mut slots);
        let filled = slots[1].as_ref().unwrap();
        assert_eq!(filled.table_id(), 0x4e);
        assert_eq!(filled.table_id_extension(), 0x0203);
        assert_eq!(filled.version(), 7);
        assert_eq!(filled.section_number(), 1);
        assert_eq!(filled.last_section_number(), 1);
        assert_eq!(filled.payload(), &hex!("0001 0002 01 4e")[..]);
    }

    #[test]
    fn schedule_segments() {
        // 16 sections (two segments), with only section 0 and 9 present
        let mut slots = vec![None; 16];
        slots[0] = eit_section(0x50, 0, 15, &hex!("0001 0002 01 52"));
        slots[9] = eit_section(0x50, 9, 15, &hex!("0001 0002 09 51"));
        fill_missing(TableIdentity::new(0x50, 0x0203), 7, Pid::new(0x12), &mut slots);
        assert!(slots.iter().all(|s| s.is_some()));
        let s3 = slots[3].as_ref().unwrap();
        assert_eq!(s3.payload(), &hex!("0001 0002 01 52")[..]);
        let s12 = slots[12].as_ref().unwrap();
        assert_eq!(s12.payload(), &hex!("0001 0002 09 52")[..]);
        assert_eq!(s12.last_section_number(), 15);
        // sections already present are untouched
        assert_eq!(slots[9].as_ref().unwrap().payload(), &hex!("0001 0002 09 51")[..]);
    }

    #[test]
    fn last_table_id_bounded() {
        let mut slots = vec![eit_section(0x50, 0, 1, &hex!("0001 0002 00 7f")), None];
        fill_missing(TableIdentity::new(0x50, 0x0203), 7, Pid::new(0x12), &mut slots);
        assert_eq!(slots[1].as_ref().unwrap().payload()[5], TID_EIT_SCHEDULE_ACTUAL_MAX);
    }

    #[test]
    fn classification() {
        assert!(is_eit_pf(TID_EIT_PF_ACTUAL));
        assert!(is_eit_pf(TID_EIT_PF_OTHER));
        assert!(!is_eit_schedule(TID_EIT_PF_OTHER));
        assert!(is_eit_schedule(TID_EIT_SCHEDULE_ACTUAL_MIN));
        assert!(is_eit_schedule(TID_EIT_SCHEDULE_OTHER_MIN));
        assert!(is_eit_schedule(TID_EIT_SCHEDULE_OTHER_MAX));
        assert!(!is_eit(0x4d));
        assert!(!is_eit(0x70));
    }

    #[test]
    fn schedule_other_bounded() {
        let mut slots = vec![eit_section(0x60, 0, 1, &hex!("0001 0002 00 7f")), None];
        fill_missing(TableIdentity::new(0x60, 0x0203), 7, Pid::new(0x12), &mut slots);
        assert_eq!(slots[1].as_ref().unwrap().payload()[5], TID_EIT_SCHEDULE_OTHER_MAX);
    }

    #[test]
    fn not_eit() {
        let mut slots = vec![None, None];
        fill_missing(TableIdentity::new(0x42, 1), 0, Pid::new(0x11), &mut slots);
        assert!(slots.iter().all(|s| s.is_none()));
    }
}
