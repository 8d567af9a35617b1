//! Grouping sections into tables.
//!
//! A [`TableAssembler`](struct.TableAssembler.html) collects the sections of one version of one
//! table (as identified by a [`TableIdentity`](../struct.TableIdentity.html) on a particular
//! PID), and produces a [`Table`](struct.Table.html) once all of them are present.

use super::{eit, Section, TableIdentity};
use crate::packet::Pid;
use log::debug;
use std::rc::Rc;

/// A complete set of sections, ordered by `section_number`, all sharing the same table identity
/// and version.
#[derive(Debug, Clone)]
pub struct Table {
    pid: Pid,
    identity: TableIdentity,
    version: u8,
    sections: Vec<Rc<Section>>,
}

impl Table {
    pub(crate) fn new(
        pid: Pid,
        identity: TableIdentity,
        version: u8,
        sections: Vec<Rc<Section>>,
    ) -> Table {
        Table {
            pid,
            identity,
            version,
            sections,
        }
    }

    /// A table made of one short section.
    pub(crate) fn from_short_section(section: Rc<Section>) -> Table {
        Table {
            pid: section.source_pid(),
            identity: section.identity(),
            version: 0,
            sections: vec![section],
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
    pub fn identity(&self) -> TableIdentity {
        self.identity
    }
    pub fn table_id(&self) -> u8 {
        self.identity.table_id
    }
    pub fn table_id_extension(&self) -> u16 {
        self.identity.table_id_extension
    }
    pub fn version(&self) -> u8 {
        self.version
    }
    pub fn sections(&self) -> &[Rc<Section>] {
        &self.sections[..]
    }
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }
    /// Total size of all the sections, in bytes.
    pub fn total_size(&self) -> usize {
        self.sections.iter().map(|s| s.len()).sum()
    }
}

/// The progress of receiving the sections of one version of a long-syntax table.
///
/// Slots are indexed by `section_number`.  `received_sections()` is always the number of
/// occupied slots, and never exceeds `expected_sections()`.
#[derive(Debug)]
pub struct TableAssembler {
    version: u8,
    slots: Vec<Option<Rc<Section>>>,
    received: usize,
    notified: bool,
}

impl TableAssembler {
    pub(crate) fn new(version: u8, last_section_number: u8) -> TableAssembler {
        TableAssembler {
            version,
            slots: vec![None; usize::from(last_section_number) + 1],
            received: 0,
            notified: false,
        }
    }

    /// Discard everything received so far, and start collecting the given version.
    pub(crate) fn init(&mut self, version: u8, last_section_number: u8) {
        self.version = version;
        self.slots.clear();
        self.slots.resize(usize::from(last_section_number) + 1, None);
        self.received = 0;
        self.notified = false;
    }

    pub fn version(&self) -> u8 {
        self.version
    }
    pub fn expected_sections(&self) -> usize {
        self.slots.len()
    }
    pub fn received_sections(&self) -> usize {
        self.received
    }
    pub fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }
    /// `true` once the table has been handed to the application, until some change in the
    /// sections received makes it eligible again.
    pub fn is_notified(&self) -> bool {
        self.notified
    }
    pub fn section(&self, section_number: u8) -> Option<&Rc<Section>> {
        self.slots
            .get(usize::from(section_number))
            .and_then(|s| s.as_ref())
    }

    /// Store the section in its slot, unless the slot is already occupied.  Returns `true` if
    /// the section was stored.
    pub(crate) fn insert(&mut self, section: Rc<Section>) -> bool {
        let slot = match self.slots.get_mut(usize::from(section.section_number())) {
            Some(slot) => slot,
            None => return false,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(section);
        self.received += 1;
        true
    }

    /// If a different section is already held for the same slot as the given one, drop the old
    /// one so that the table can be delivered again once complete.  Returns `true` if the
    /// content had changed.
    pub(crate) fn invalidate_changed(&mut self, section: &Section) -> bool {
        let slot = match self.slots.get_mut(usize::from(section.section_number())) {
            Some(slot) => slot,
            None => return false,
        };
        let changed = matches!(slot, Some(old) if old.content() != section.content());
        if changed {
            *slot = None;
            self.received -= 1;
            self.notified = false;
        }
        changed
    }

    /// Produce the table for delivery to the application, if that has not been done already and
    /// the table is complete, or if `pack` or `fill` force delivery of an incomplete table.
    ///
    /// With `pack`, missing sections are squeezed out and the remaining ones renumbered.  With
    /// `fill`, missing sections of an EIT are replaced with empty ones.  A table still having
    /// missing sections after that is not produced.  When a table is produced, the assembler is
    /// marked as notified.
    pub(crate) fn take_table(
        &mut self,
        pid: Pid,
        identity: TableIdentity,
        pack: bool,
        fill: bool,
    ) -> Option<Table> {
        if self.notified || !(self.is_complete() || pack || fill) {
            return None;
        }
        let mut slots = self.slots.clone();
        if pack {
            slots = packed(slots);
        }
        if fill {
            eit::fill_missing(identity, self.version, pid, &mut slots);
        }
        let sections = slots.into_iter().collect::<Option<Vec<_>>>()?;
        if sections.is_empty() {
            return None;
        }
        debug!(
            "{:?} {}: table version {} with {} sections",
            pid,
            identity,
            self.version,
            sections.len()
        );
        self.notified = true;
        Some(Table::new(pid, identity, self.version, sections))
    }
}

/// Remove the gaps, renumbering sections to `0..n-1` with `last_section_number` of `n-1`.
fn packed(slots: Vec<Option<Rc<Section>>>) -> Vec<Option<Rc<Section>>> {
    let present = slots.into_iter().flatten().collect::<Vec<_>>();
    let last = present.len().saturating_sub(1) as u8;
    present
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            if usize::from(s.section_number()) == i && s.last_section_number() == last {
                Some(s)
            } else {
                Some(Rc::new(s.renumbered(i as u8, last)))
            }
        })
        .collect()
}
