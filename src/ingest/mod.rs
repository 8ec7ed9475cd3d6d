//! # Ingestion Module
//!
//! Turns raw radio payloads into timestamped [`LogRecord`](crate::record::LogRecord)s
//! on the durable spool.

pub mod clock;
pub mod packet;
pub mod service;

pub use clock::{ClockSource, SystemClock, TimeSource, Timestamper};
pub use packet::{validate_packet, PacketError, ValidPacket};
pub use service::{IngestConfig, IngestCounters, IngestHandle, IngestStats, IngestionService};
