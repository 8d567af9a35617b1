//! Reassembly of sections and tables from the packets of a Transport Stream.
//!
//! [`SectionDemux`](struct.SectionDemux.html) is fed packets, keeps the state needed to rebuild
//! sections on every PID it has been asked to watch, and passes results to the application
//! through three kinds of handler:
//!
//!  - a [`TableHandler`](trait.TableHandler.html), given each complete table,
//!  - a [`SectionHandler`](trait.SectionHandler.html), given every valid section,
//!  - an [`InvalidSectionHandler`](trait.InvalidSectionHandler.html), given the data of sections
//!    which failed some check.
//!
//! Malformed input never produces an error; instead it is counted in the
//! [`Status`](struct.Status.html) and the demultiplexer resynchronises as best it can.
//!
//! Handlers are given `&mut SectionDemux`, and may change its configuration while they run.
//! A request to reset the PID currently being processed (or the whole demultiplexer) is held
//! back until the handler returns, and processing of the current packet then stops.

use crate::packet::{self, ContinuityCounter, Pid};
use crate::psi::table::{Table, TableAssembler};
use crate::psi::validate::{self, Extract, InvalidReason, SectionValidator, Validated};
use crate::psi::{CurrentNext, Section, TableIdentity};
use fixedbitset::FixedBitSet;
use log::{debug, trace, warn};
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// Receives each complete table.
pub trait TableHandler {
    fn handle_table(&mut self, demux: &mut SectionDemux, table: &Table);

    /// Called when the state of the demultiplexer is discarded, for the given PID, or for all
    /// PIDs if `None`.
    fn on_reset(&mut self, _pid: Option<Pid>) {}
}

impl<F> TableHandler for F
where
    F: FnMut(&mut SectionDemux, &Table),
{
    fn handle_table(&mut self, demux: &mut SectionDemux, table: &Table) {
        (self)(demux, table)
    }
}

/// Receives every valid section, whether or not it completes a table.
pub trait SectionHandler {
    fn handle_section(&mut self, demux: &mut SectionDemux, section: &Rc<Section>);
}

impl<F> SectionHandler for F
where
    F: FnMut(&mut SectionDemux, &Rc<Section>),
{
    fn handle_section(&mut self, demux: &mut SectionDemux, section: &Rc<Section>) {
        (self)(demux, section)
    }
}

/// Receives the data of sections which were rejected.
pub trait InvalidSectionHandler {
    fn handle_invalid_section(&mut self, demux: &mut SectionDemux, section: &InvalidSection);
}

impl<F> InvalidSectionHandler for F
where
    F: FnMut(&mut SectionDemux, &InvalidSection),
{
    fn handle_invalid_section(&mut self, demux: &mut SectionDemux, section: &InvalidSection) {
        (self)(demux, section)
    }
}

/// The raw data of a section which was rejected, and the reason why.
#[derive(Debug, Clone)]
pub struct InvalidSection {
    pid: Pid,
    data: Vec<u8>,
    reason: InvalidReason,
    first_packet: u64,
    last_packet: u64,
}

impl InvalidSection {
    pub fn pid(&self) -> Pid {
        self.pid
    }
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }
    pub fn reason(&self) -> &InvalidReason {
        &self.reason
    }
    pub fn first_packet_index(&self) -> u64 {
        self.first_packet
    }
    pub fn last_packet_index(&self) -> u64 {
        self.last_packet
    }
}

/// Counts of the problems found in the packets and sections processed so far.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Status {
    /// packets without the sync byte
    pub invalid_ts: u64,
    /// continuity counter errors
    pub discontinuities: u64,
    /// scrambled packets, which can't carry sections we can read
    pub scrambled: u64,
    /// invalid `section_length`
    pub inv_sect_length: u64,
    /// `section_number` out of range, or `last_section_number` changed within a table version
    pub inv_sect_index: u64,
    /// section content changed without a new version number
    pub inv_sect_version: u64,
    /// CRC errors
    pub wrong_crc: u64,
    /// 'next' sections, when only 'current' ones were asked for
    pub is_next: u64,
    /// sections cut short by the start of another one
    pub truncated_sect: u64,
}

impl Status {
    fn counters(&self) -> [(&'static str, u64); 9] {
        [
            ("Invalid TS packets", self.invalid_ts),
            ("TS packets discontinuities", self.discontinuities),
            ("Scrambled TS packets", self.scrambled),
            ("Invalid section lengths", self.inv_sect_length),
            ("Truncated sections", self.truncated_sect),
            ("Invalid section index", self.inv_sect_index),
            ("Invalid unchanged section version", self.inv_sect_version),
            ("Corrupted sections (bad CRC)", self.wrong_crc),
            ("Next sections (not yet applicable)", self.is_next),
        ]
    }

    /// `true` if any counter is non-zero.
    pub fn has_errors(&self) -> bool {
        self.counters().iter().any(|&(_, v)| v != 0)
    }

    pub fn reset(&mut self) {
        *self = Status::default();
    }

    /// Formats only the non-zero counters.
    pub fn display_errors(&self) -> StatusErrors<'_> {
        StatusErrors(self)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.counters().iter() {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

/// Display of the non-zero counters of a [`Status`](struct.Status.html).
pub struct StatusErrors<'a>(&'a Status);

impl<'a> fmt::Display for StatusErrors<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.0.counters().iter().filter(|&&(_, v)| v != 0) {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

/// Settings for a [`SectionDemux`](struct.SectionDemux.html).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxOptions {
    /// Deliver sections with `current_next_indicator` set.
    pub get_current: bool,
    /// Deliver sections with `current_next_indicator` clear.
    pub get_next: bool,
    /// Detect sections whose content changes while the table version stays the same, and
    /// deliver the table again once the new content is complete.
    pub track_invalid_versions: bool,
}

impl Default for DemuxOptions {
    fn default() -> DemuxOptions {
        DemuxOptions {
            get_current: true,
            get_next: false,
            track_invalid_versions: false,
        }
    }
}

/// Misuse of the byte-buffer interface of the demultiplexer.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DemuxError {
    #[error("no data given to the demultiplexer")]
    EmptyBuffer,
    #[error("buffer ends with {remaining} bytes, which don't make up a whole packet")]
    PartialPacket { remaining: usize },
}

/// Reassembly state for the sections of one PID.
#[derive(Debug, Default)]
pub struct ChannelState {
    synchronized: bool,
    last_cc: Option<ContinuityCounter>,
    buffer: Vec<u8>,
    /// index of the packet where the section at the front of `buffer` started
    section_start: u64,
    tables: BTreeMap<TableIdentity, TableAssembler>,
}

struct Appended {
    /// position in the buffer of the section announced by the pointer field, if any
    anchor: Option<usize>,
}

impl ChannelState {
    /// `true` when the front of the buffered data is the start of a section.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }
    pub fn last_continuity_counter(&self) -> Option<ContinuityCounter> {
        self.last_cc
    }
    /// The number of bytes held, belonging to sections not yet complete.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
    pub fn tables(&self) -> impl Iterator<Item = (&TableIdentity, &TableAssembler)> {
        self.tables.iter()
    }

    fn sync_lost(&mut self) {
        self.synchronized = false;
        self.buffer.clear();
    }

    /// Append the section data from the given packet, returning `None` if the packet has nothing
    /// to add.
    fn accept(
        &mut self,
        pk: &packet::Packet<'_>,
        index: u64,
        status: &mut Status,
    ) -> Option<Appended> {
        if pk.is_scrambled() {
            status.scrambled += 1;
            self.sync_lost();
            return None;
        }
        let cc = pk.continuity_counter();
        if self.synchronized {
            if let Some(last) = self.last_cc {
                if cc == last {
                    // duplicate packet
                    return None;
                }
                if !cc.follows(last) {
                    debug!(
                        "{:?}: sync lost on discontinuity, {} -> {}, packet index {}",
                        pk.pid(),
                        last.count(),
                        cc.count(),
                        index
                    );
                    status.discontinuities += 1;
                    self.sync_lost();
                }
            }
        }
        self.last_cc = Some(cc);

        let payload = pk.payload()?;
        let pusi = pk.payload_unit_start_indicator();
        let (mut data, mut pointer) = if pusi {
            if payload.starts_with(&[0x00, 0x00, 0x01]) {
                // PES start code prefix; this PID does not carry sections
                self.sync_lost();
                return None;
            }
            let pointer = usize::from(payload[0]);
            if 1 + pointer >= payload.len() {
                warn!(
                    "{:?}: pointer_field {} beyond payload of {} bytes",
                    pk.pid(),
                    pointer,
                    payload.len()
                );
                self.sync_lost();
                return None;
            }
            if pointer == 0 && self.buffer.is_empty() {
                self.section_start = index;
            }
            (&payload[1..], pointer)
        } else {
            (payload, 0)
        };
        if !self.synchronized {
            if !pusi {
                return None;
            }
            // skip the tail of a section which we didn't see start
            data = &data[pointer..];
            pointer = 0;
            self.synchronized = true;
            self.section_start = index;
        }
        self.buffer.extend_from_slice(data);
        let anchor = if pusi {
            Some(self.buffer.len() - data.len() + pointer)
        } else {
            None
        };
        Some(Appended { anchor })
    }
}

/// Reassembly state for each PID, indexed by PID value.
#[derive(Debug, Default)]
struct Channels {
    channels_by_pid: Vec<Option<ChannelState>>,
}

impl Channels {
    fn get(&self, pid: Pid) -> Option<&ChannelState> {
        self.channels_by_pid
            .get(usize::from(pid))
            .and_then(|c| c.as_ref())
    }

    fn get_mut(&mut self, pid: Pid) -> Option<&mut ChannelState> {
        self.channels_by_pid
            .get_mut(usize::from(pid))
            .and_then(|c| c.as_mut())
    }

    fn get_or_insert(&mut self, pid: Pid) -> &mut ChannelState {
        let i = usize::from(pid);
        if i >= self.channels_by_pid.len() {
            self.channels_by_pid.resize_with(i + 1, || None);
        }
        self.channels_by_pid[i].get_or_insert_with(ChannelState::default)
    }

    fn remove(&mut self, pid: Pid) {
        if let Some(c) = self.channels_by_pid.get_mut(usize::from(pid)) {
            *c = None;
        }
    }

    fn clear(&mut self) {
        self.channels_by_pid.clear();
    }

    fn pids(&self) -> Vec<Pid> {
        self.channels_by_pid
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| Pid::new(i as u16)))
            .collect()
    }
}

/// Holds a handler, which is taken out of the slot while it runs so that it can be given
/// `&mut SectionDemux`.
struct HandlerSlot<H: ?Sized> {
    handler: Option<Box<H>>,
    taken: bool,
    /// `set()` was called while the handler was taken
    replaced: bool,
}

impl<H: ?Sized> Default for HandlerSlot<H> {
    fn default() -> HandlerSlot<H> {
        HandlerSlot {
            handler: None,
            taken: false,
            replaced: false,
        }
    }
}

impl<H: ?Sized> HandlerSlot<H> {
    fn set(&mut self, handler: Option<Box<H>>) {
        self.handler = handler;
        if self.taken {
            self.replaced = true;
        }
    }

    fn is_set(&self) -> bool {
        self.handler.is_some() || (self.taken && !self.replaced)
    }

    fn take(&mut self) -> Option<Box<H>> {
        let handler = self.handler.take();
        if handler.is_some() {
            self.taken = true;
            self.replaced = false;
        }
        handler
    }

    /// Put back a handler given by `take()`, unless another was set meanwhile.  Returns `true`
    /// if the handler was put back.
    fn restore(&mut self, handler: Box<H>) -> bool {
        let restored = !self.replaced;
        if restored {
            self.handler = Some(handler);
        }
        self.taken = false;
        self.replaced = false;
        restored
    }
}

/// Resets requested by a handler, to be applied once the handler returns.
#[derive(Debug, Default)]
struct PendingResets {
    all: bool,
    dispatch_pid: bool,
}

/// Marks that handlers are being run for a PID, for as long as it lives.  Resets the handlers
/// request for that PID, or for everything, are applied when it is finished or dropped, so they
/// also happen if a handler panics.
struct DispatchScope<'a> {
    demux: &'a mut SectionDemux,
    pid: Pid,
    finished: bool,
}

impl<'a> DispatchScope<'a> {
    fn begin(demux: &'a mut SectionDemux, pid: Pid) -> DispatchScope<'a> {
        debug_assert!(demux.dispatching.is_none());
        demux.dispatching = Some(pid);
        demux.pending = PendingResets::default();
        DispatchScope {
            demux,
            pid,
            finished: false,
        }
    }

    /// Returns `true` if a pending reset was applied.
    fn finish(mut self) -> bool {
        self.finished = true;
        self.demux.end_dispatch(self.pid)
    }
}

impl<'a> std::ops::Deref for DispatchScope<'a> {
    type Target = SectionDemux;

    fn deref(&self) -> &SectionDemux {
        self.demux
    }
}

impl<'a> std::ops::DerefMut for DispatchScope<'a> {
    fn deref_mut(&mut self) -> &mut SectionDemux {
        self.demux
    }
}

impl<'a> Drop for DispatchScope<'a> {
    fn drop(&mut self) {
        if !self.finished {
            self.demux.end_dispatch(self.pid);
        }
    }
}

/// Rebuilds sections and tables from the packets of the PIDs it is asked to watch.
///
/// ```
/// # use ts_section_demux::demultiplex::SectionDemux;
/// # use ts_section_demux::packet::Pid;
/// # use ts_section_demux::psi::table::Table;
/// let mut demux = SectionDemux::new();
/// demux.add_pid(Pid::PAT);
/// demux.set_table_handler(Some(Box::new(|_demux: &mut SectionDemux, table: &Table| {
///     println!("table {} with {} sections", table.identity(), table.section_count());
/// })));
/// # let ts_bytes = [0u8; 0];
/// demux.push(&ts_bytes[..]).ok();
/// ```
pub struct SectionDemux {
    pid_filter: FixedBitSet,
    channels: Channels,
    table_handler: HandlerSlot<dyn TableHandler>,
    section_handler: HandlerSlot<dyn SectionHandler>,
    invalid_handler: HandlerSlot<dyn InvalidSectionHandler>,
    /// resets which happened while the table handler was taken, for its `on_reset()`
    table_reset_notices: Vec<Option<Pid>>,
    options: DemuxOptions,
    status: Status,
    packet_count: u64,
    dispatching: Option<Pid>,
    pending: PendingResets,
}

impl Default for SectionDemux {
    fn default() -> SectionDemux {
        SectionDemux::with_options(DemuxOptions::default())
    }
}

impl SectionDemux {
    pub fn new() -> SectionDemux {
        SectionDemux::default()
    }

    pub fn with_options(options: DemuxOptions) -> SectionDemux {
        SectionDemux {
            pid_filter: FixedBitSet::with_capacity(Pid::PID_COUNT),
            channels: Channels::default(),
            table_handler: HandlerSlot::default(),
            section_handler: HandlerSlot::default(),
            invalid_handler: HandlerSlot::default(),
            table_reset_notices: Vec::new(),
            options,
            status: Status::default(),
            packet_count: 0,
            dispatching: None,
            pending: PendingResets::default(),
        }
    }

    pub fn options(&self) -> DemuxOptions {
        self.options
    }

    /// Choose whether sections marked 'current' and/or 'next' are delivered.
    pub fn set_current_next(&mut self, current: bool, next: bool) {
        self.options.get_current = current;
        self.options.get_next = next;
    }

    pub fn track_invalid_section_versions(&mut self, on: bool) {
        self.options.track_invalid_versions = on;
    }

    pub fn set_table_handler(&mut self, handler: Option<Box<dyn TableHandler>>) {
        self.table_handler.set(handler);
    }

    pub fn set_section_handler(&mut self, handler: Option<Box<dyn SectionHandler>>) {
        self.section_handler.set(handler);
    }

    pub fn set_invalid_section_handler(
        &mut self,
        handler: Option<Box<dyn InvalidSectionHandler>>,
    ) {
        self.invalid_handler.set(handler);
    }

    /// Watch exactly the given PIDs.  State held for PIDs no longer watched is discarded.
    pub fn set_pid_filter<I: IntoIterator<Item = Pid>>(&mut self, pids: I) {
        let mut filter = FixedBitSet::with_capacity(Pid::PID_COUNT);
        for pid in pids {
            filter.insert(usize::from(pid));
        }
        let removed = self
            .pid_filter
            .ones()
            .filter(|&i| !filter.contains(i))
            .collect::<Vec<_>>();
        self.pid_filter = filter;
        for i in removed {
            self.reset_pid(Pid::new(i as u16));
        }
    }

    pub fn add_pid(&mut self, pid: Pid) {
        self.pid_filter.insert(usize::from(pid));
    }

    /// Stop watching the given PID, and discard the state held for it.
    pub fn remove_pid(&mut self, pid: Pid) {
        if self.pid_filter.contains(usize::from(pid)) {
            self.pid_filter.set(usize::from(pid), false);
            self.reset_pid(pid);
        }
    }

    pub fn has_pid(&self, pid: Pid) -> bool {
        self.pid_filter.contains(usize::from(pid))
    }

    pub fn pid_count(&self) -> usize {
        self.pid_filter.count_ones(..)
    }

    /// Discard all reassembly state, and the status counters.  The set of watched PIDs and the
    /// handlers are kept.
    pub fn reset(&mut self) {
        if self.dispatching.is_some() {
            self.pending.all = true;
        } else {
            self.immediate_reset();
        }
    }

    /// Discard the reassembly state of one PID.
    pub fn reset_pid(&mut self, pid: Pid) {
        if self.dispatching == Some(pid) {
            self.pending.dispatch_pid = true;
        } else {
            self.immediate_reset_pid(pid);
        }
    }

    fn immediate_reset(&mut self) {
        self.channels.clear();
        self.status.reset();
        self.notify_reset(None);
    }

    fn immediate_reset_pid(&mut self, pid: Pid) {
        self.channels.remove(pid);
        self.notify_reset(Some(pid));
    }

    fn notify_reset(&mut self, pid: Option<Pid>) {
        if self.table_handler.taken {
            self.table_reset_notices.push(pid);
        } else if let Some(h) = self.table_handler.handler.as_mut() {
            h.on_reset(pid);
        }
    }

    pub fn status(&self) -> Status {
        self.status.clone()
    }

    /// The number of packets given so far, whether on watched PIDs or not.
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn channel(&self, pid: Pid) -> Option<&ChannelState> {
        self.channels.get(pid)
    }

    pub fn table_assembler(&self, pid: Pid, identity: TableIdentity) -> Option<&TableAssembler> {
        self.channels.get(pid).and_then(|c| c.tables.get(&identity))
    }

    /// Split the given buffer into packets and process each in turn.
    ///
    /// All whole packets are processed even when an error is returned for some trailing bytes.
    pub fn push(&mut self, buf: &[u8]) -> Result<(), DemuxError> {
        if buf.is_empty() {
            return Err(DemuxError::EmptyBuffer);
        }
        let mut chunks = buf.chunks_exact(packet::Packet::SIZE);
        for pk_buf in &mut chunks {
            self.feed_packet(&packet::Packet::new(pk_buf));
        }
        match chunks.remainder().len() {
            0 => Ok(()),
            remaining => Err(DemuxError::PartialPacket { remaining }),
        }
    }

    /// Process one packet.
    pub fn feed_packet(&mut self, pk: &packet::Packet<'_>) {
        if let Some(pid) = self.dispatching {
            warn!(
                "packet given to demultiplexer from within a handler for {:?}; ignored",
                pid
            );
            return;
        }
        if self.pid_filter.contains(usize::from(pk.pid())) {
            self.process_packet(pk);
        }
        self.packet_count += 1;
    }

    fn process_packet(&mut self, pk: &packet::Packet<'_>) {
        if !pk.has_valid_sync() {
            self.status.invalid_ts += 1;
            return;
        }
        let pid = pk.pid();
        let index = self.packet_count;
        let chan = self.channels.get_or_insert(pid);
        if let Some(appended) = chan.accept(pk, index, &mut self.status) {
            self.extract_sections(pid, appended.anchor);
        }
    }

    fn validator(&self) -> SectionValidator {
        SectionValidator {
            get_current: self.options.get_current,
            get_next: self.options.get_next,
        }
    }

    fn extract_sections(&mut self, pid: Pid, anchor: Option<usize>) {
        let index = self.packet_count;
        let mut start = 0;
        loop {
            let validator = self.validator();
            let chan = match self.channels.get_mut(pid) {
                Some(chan) => chan,
                None => return,
            };
            let buf = &chan.buffer[start..];
            match validate::next_candidate(buf, anchor.and_then(|a| a.checked_sub(start))) {
                Extract::Incomplete => break,
                Extract::Stuffing { resume_at: Some(n) } => start += n,
                Extract::Stuffing { resume_at: None } => {
                    start = chan.buffer.len();
                    break;
                }
                Extract::BadLength {
                    section_length,
                    resume_at,
                } => {
                    debug!(
                        "{:?}: invalid section length {}, table_id {:#04x}, packet index {}",
                        pid, section_length, buf[0], index
                    );
                    self.status.inv_sect_length += 1;
                    match resume_at {
                        Some(n) => start += n,
                        None => {
                            chan.sync_lost();
                            return;
                        }
                    }
                }
                Extract::Candidate {
                    length,
                    declared_length,
                    truncated,
                } => {
                    let data = &buf[..length];
                    if truncated {
                        debug!(
                            "{:?}: truncated section, {} bytes instead of {}, table_id {:#04x}, packet index {}",
                            pid, length, declared_length, data[0], index
                        );
                        self.status.truncated_sect += 1;
                    }
                    let verdict =
                        validator.check(data, truncated.then_some(declared_length), pid);
                    let raw = match verdict {
                        Validated::Invalid(_) => data.to_vec(),
                        _ => Vec::new(),
                    };
                    let first = chan.section_start;
                    // the next section necessarily starts in the current packet
                    chan.section_start = index;
                    start += length;
                    if self.handle_candidate(pid, verdict, raw, first, index) {
                        return;
                    }
                }
            }
        }
        if let Some(chan) = self.channels.get_mut(pid) {
            let consumed = start.min(chan.buffer.len());
            chan.buffer.drain(..consumed);
        }
    }

    /// Returns `true` if a handler reset this PID (or everything), so that processing must stop.
    fn handle_candidate(
        &mut self,
        pid: Pid,
        verdict: Validated,
        raw: Vec<u8>,
        first: u64,
        last: u64,
    ) -> bool {
        match verdict {
            Validated::Filtered(CurrentNext::Next) => {
                self.status.is_next += 1;
                false
            }
            Validated::Filtered(CurrentNext::Current) => false,
            Validated::Invalid(reason) => {
                match reason {
                    InvalidReason::Truncated { .. } => (),
                    InvalidReason::SectionNumber { .. }
                    | InvalidReason::LastSectionNumber { .. } => self.status.inv_sect_index += 1,
                    InvalidReason::Crc { .. } => self.status.wrong_crc += 1,
                }
                if !matches!(reason, InvalidReason::Truncated { .. }) {
                    debug!("{:?}: {}, packet index {}", pid, reason, last);
                }
                self.deliver_invalid(InvalidSection {
                    pid,
                    data: raw,
                    reason,
                    first_packet: first,
                    last_packet: last,
                })
            }
            Validated::Valid(section) => {
                self.deliver_section(Rc::new(section.with_packet_indices(first, last)))
            }
        }
    }

    fn deliver_invalid(&mut self, invalid: InvalidSection) -> bool {
        if !self.invalid_handler.is_set() {
            return false;
        }
        self.dispatch(invalid.pid, |demux| demux.call_invalid_handler(&invalid))
    }

    fn deliver_section(&mut self, section: Rc<Section>) -> bool {
        let pid = section.source_pid();
        trace!("{:?}: {:?}", pid, section);
        if !section.is_long() {
            return self.dispatch(pid, |demux| {
                demux.call_section_handler(&section);
                if demux.table_handler.is_set() {
                    demux.call_table_handler(&Table::from_short_section(section.clone()));
                }
            });
        }

        let identity = section.identity();
        let assemble = self.table_handler.is_set();
        if assemble {
            let track = self.options.track_invalid_versions;
            let chan = self.channels.get_or_insert(pid);
            let version = section.version();
            let last_section_number = section.last_section_number();
            let asm = chan
                .tables
                .entry(identity)
                .or_insert_with(|| TableAssembler::new(version, last_section_number));
            if asm.version() != version {
                asm.init(version, last_section_number);
            }
            let expected = (asm.expected_sections() - 1) as u8;
            if last_section_number != expected {
                let reason = InvalidReason::LastSectionNumber {
                    expected,
                    actual: last_section_number,
                };
                debug!("{:?} {}: {}", pid, identity, reason);
                self.status.inv_sect_index += 1;
                return self.deliver_invalid(InvalidSection {
                    pid,
                    data: section.content().to_vec(),
                    reason,
                    first_packet: section.first_packet_index(),
                    last_packet: section.last_packet_index(),
                });
            }
            if track && asm.invalidate_changed(&section) {
                debug!(
                    "{:?} {}: section {} changed without version change (version {})",
                    pid,
                    identity,
                    section.section_number(),
                    version
                );
                self.status.inv_sect_version += 1;
            }
        }

        self.dispatch(pid, |demux| {
            demux.call_section_handler(&section);
            if !(assemble && demux.table_handler.is_set()) {
                return;
            }
            let table = demux
                .channels
                .get_mut(pid)
                .and_then(|c| c.tables.get_mut(&identity))
                .and_then(|asm| {
                    if asm.insert(section.clone()) {
                        asm.take_table(pid, identity, false, false)
                    } else {
                        None
                    }
                });
            if let Some(table) = table {
                demux.call_table_handler(&table);
            }
        })
    }

    /// Deliver tables which are not yet complete.
    ///
    /// With `pack`, any sections received for each table are delivered, renumbered to remove
    /// the gaps.  With `fill`, missing sections of EITs are replaced with empty ones.  Tables
    /// already delivered are not delivered again.
    pub fn flush_all(&mut self, pack: bool, fill: bool) {
        if let Some(pid) = self.dispatching {
            warn!("flush requested from within a handler for {:?}; ignored", pid);
            return;
        }
        for pid in self.channels.pids() {
            self.dispatch(pid, |demux| {
                let identities = demux
                    .channels
                    .get(pid)
                    .map(|c| c.tables.keys().copied().collect::<Vec<_>>())
                    .unwrap_or_default();
                for identity in identities {
                    if !demux.table_handler.is_set() {
                        break;
                    }
                    let table = demux
                        .channels
                        .get_mut(pid)
                        .and_then(|c| c.tables.get_mut(&identity))
                        .and_then(|asm| asm.take_table(pid, identity, pack, fill));
                    if let Some(table) = table {
                        demux.call_table_handler(&table);
                    }
                }
            });
        }
    }

    /// Run handlers for the given PID.  Resets they request for that PID, or for everything, are
    /// applied once `f` returns or unwinds.  Returns `true` if such a reset was applied.
    fn dispatch<F: FnOnce(&mut SectionDemux)>(&mut self, pid: Pid, f: F) -> bool {
        let mut scope = DispatchScope::begin(self, pid);
        f(&mut *scope);
        scope.finish()
    }

    fn end_dispatch(&mut self, pid: Pid) -> bool {
        self.dispatching = None;
        let pending = std::mem::take(&mut self.pending);
        if pending.all {
            self.immediate_reset();
            true
        } else if pending.dispatch_pid {
            self.immediate_reset_pid(pid);
            true
        } else {
            false
        }
    }

    fn call_table_handler(&mut self, table: &Table) {
        if let Some(mut h) = self.table_handler.take() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| h.handle_table(self, table)));
            let notices = std::mem::take(&mut self.table_reset_notices);
            if self.table_handler.restore(h) {
                if let Some(h) = self.table_handler.handler.as_mut() {
                    for pid in notices {
                        h.on_reset(pid);
                    }
                }
            }
            if let Err(payload) = result {
                panic::resume_unwind(payload);
            }
        }
    }

    fn call_section_handler(&mut self, section: &Rc<Section>) {
        if let Some(mut h) = self.section_handler.take() {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| h.handle_section(self, section)));
            self.section_handler.restore(h);
            if let Err(payload) = result {
                panic::resume_unwind(payload);
            }
        }
    }

    fn call_invalid_handler(&mut self, invalid: &InvalidSection) {
        if let Some(mut h) = self.invalid_handler.take() {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| h.handle_invalid_section(self, invalid)));
            self.invalid_handler.restore(h);
            if let Err(payload) = result {
                panic::resume_unwind(payload);
            }
        }
    }
}

/// Collects tables for a [`StandaloneTableDemux`](struct.StandaloneTableDemux.html).
struct TableCollector {
    tables: Rc<RefCell<Vec<Table>>>,
}

impl TableHandler for TableCollector {
    fn handle_table(&mut self, _demux: &mut SectionDemux, table: &Table) {
        self.tables.borrow_mut().push(table.clone());
    }

    fn on_reset(&mut self, pid: Option<Pid>) {
        let mut tables = self.tables.borrow_mut();
        match pid {
            None => tables.clear(),
            Some(pid) => tables.retain(|t| t.pid() != pid),
        }
    }
}

/// A demultiplexer which keeps every table it completes, for the application to pick up later.
///
/// Resetting the demultiplexer (or one of its PIDs) also forgets the tables collected (for that
/// PID).
pub struct StandaloneTableDemux {
    demux: SectionDemux,
    tables: Rc<RefCell<Vec<Table>>>,
}

impl StandaloneTableDemux {
    pub fn new<I: IntoIterator<Item = Pid>>(pids: I) -> StandaloneTableDemux {
        StandaloneTableDemux::with_options(pids, DemuxOptions::default())
    }

    pub fn with_options<I: IntoIterator<Item = Pid>>(
        pids: I,
        options: DemuxOptions,
    ) -> StandaloneTableDemux {
        let tables = Rc::new(RefCell::new(Vec::new()));
        let mut demux = SectionDemux::with_options(options);
        demux.set_pid_filter(pids);
        demux.set_table_handler(Some(Box::new(TableCollector {
            tables: tables.clone(),
        })));
        StandaloneTableDemux { demux, tables }
    }

    pub fn feed_packet(&mut self, pk: &packet::Packet<'_>) {
        self.demux.feed_packet(pk)
    }

    pub fn push(&mut self, buf: &[u8]) -> Result<(), DemuxError> {
        self.demux.push(buf)
    }

    pub fn tables(&self) -> Ref<'_, Vec<Table>> {
        self.tables.borrow()
    }

    pub fn table_count(&self) -> usize {
        self.tables.borrow().len()
    }

    /// Remove and return the tables collected so far.
    pub fn take_tables(&mut self) -> Vec<Table> {
        std::mem::take(&mut *self.tables.borrow_mut())
    }

    pub fn reset(&mut self) {
        self.demux.reset()
    }

    pub fn reset_pid(&mut self, pid: Pid) {
        self.demux.reset_pid(pid)
    }

    pub fn flush_all(&mut self, pack: bool, fill: bool) {
        self.demux.flush_all(pack, fill)
    }

    pub fn status(&self) -> Status {
        self.demux.status()
    }

    /// The underlying demultiplexer.  Section handlers may be installed on it, but replacing its
    /// table handler stops tables being collected.
    pub fn demux_mut(&mut self) -> &mut SectionDemux {
        &mut self.demux
    }

    pub fn demux(&self) -> &SectionDemux {
        &self.demux
    }
}
