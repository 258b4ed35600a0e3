//! # Programmable packet processing over AF_XDP
//!
//! ## Purpose
//!
//! This crate turns the raw socket runtime of `xsk-socket` into a packet
//! service: received frames become typed [`packet::Packet`] views, flow
//! through a user-assembled [`pipeline::Pipeline`] of processors, and are
//! dropped, passed, re-entered, or transmitted on any bound interface.
//!
//! ## Main components
//!
//! - [`proto`]: allocation-free header codecs for Ethernet, IPv4, TCP,
//!   UDP, ICMP and ARP.
//! - [`packet`]: the zero-copy packet view with lazily parsed layers.
//! - [`processor`] / [`pipeline`]: the per-packet plug-in interface and
//!   its ordered composition.
//! - [`stats`]: process-wide atomic counters with derived rates.
//! - [`service`]: binds (interface, queue) pairs to a redirect program
//!   and runs one worker per socket.

pub mod packet;
pub mod pipeline;
pub mod processor;
pub mod proto;
pub mod service;
pub mod stats;

pub use packet::{Packet, PacketError, PacketSource};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError};
pub use processor::{PacketAction, Processor, Verdict};
pub use service::{InterfaceConfig, Service, ServiceConfig, ServiceError};
pub use stats::{StatsCollector, StatsSnapshot};
