//! Reassembly of the sections and tables carried in an MPEG2 Transport Stream, per the
//! _ISO/IEC 13818-1_ standard.
//!
//! Packets are given to a [`SectionDemux`](demultiplex/struct.SectionDemux.html), which rebuilds
//! the _Program Specific Information_ sections spread across the packets of the PIDs it watches,
//! checks them, groups them into tables, and hands the results to application-provided handlers.
//!
//! # Design principals
//!
//!  * *Tolerant of damaged input*.  Broadcast streams lose, repeat and corrupt packets.  None of
//!    this is treated as an error to be returned to the caller; problems are counted in a
//!    [`Status`](demultiplex/struct.Status.html), and the demultiplexer recovers at the next
//!    opportunity the stream offers.
//!  * *Non-blocking*.  It should be possible to integrate this library into a system non-blocking
//!    event-loop.  The caller has to 'push' data.
//!  * *Generic*.  Only the syntax common to all sections is interpreted.  The many specific
//!    types of table defined by 13818-1, DVB, ATSC, ISDB etc. are left to other crates.
//!  * *Transport Neutral*.  There is no code here supporting consuming from files or the
//!    network.  The APIs accept `&[u8]`, and the caller handles providing the data from wherever.
//!
//! # Single-threaded
//!
//! A demultiplexer is fed from one thread.  Sections are shared between the demultiplexer and
//! handlers as `Rc<Section>`, so none of the types here are `Send`.  Applications wanting to use
//! several threads can give each its own demultiplexer for a distinct set of PIDs.

#![forbid(unsafe_code)]

pub mod continuity;
pub mod demultiplex;
mod mpegts_crc;
pub mod packet;
pub mod psi;

pub use demultiplex::{DemuxOptions, SectionDemux, StandaloneTableDemux, Status};
pub use packet::{Packet, Pid};
pub use psi::table::Table;
pub use psi::{Section, TableIdentity};
