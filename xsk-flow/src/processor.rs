//! # Processor interface
//!
//! ## Purpose
//!
//! A processor is one stage of the pipeline: it inspects a packet and
//! returns a verdict steering it. Processors own their private state and
//! the pipeline treats them as opaque trait objects.
//!
//! Stages run behind shared references because one pipeline instance may
//! serve several workers; a processor that keeps state must therefore
//! use interior mutability and stay reentrant.

use crate::packet::Packet;
use crate::pipeline::PipelineError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a packet goes after a stage has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketAction {
    /// Release the frame without further processing.
    Drop,
    /// Hand the packet to the next stage, or out of the pipeline after
    /// the last one.
    Pass,
    /// Queue the frame for transmission on a bound interface queue.
    Transmit { if_index: u32, queue_id: u32 },
    /// Run the packet through the pipeline again from the first stage.
    Recirculate,
}

/// A stage's verdict: the action plus whether the packet bytes were
/// changed in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub action: PacketAction,
    pub modified: bool,
}

impl Verdict {
    pub fn pass() -> Self {
        Verdict {
            action: PacketAction::Pass,
            modified: false,
        }
    }

    pub fn drop() -> Self {
        Verdict {
            action: PacketAction::Drop,
            modified: false,
        }
    }

    pub fn transmit(if_index: u32, queue_id: u32) -> Self {
        Verdict {
            action: PacketAction::Transmit { if_index, queue_id },
            modified: false,
        }
    }

    pub fn recirculate() -> Self {
        Verdict {
            action: PacketAction::Recirculate,
            modified: false,
        }
    }

    pub fn modified(mut self) -> Self {
        self.modified = true;
        self
    }
}

/// One pipeline stage.
pub trait Processor: Send + Sync {
    /// Handles one packet.
    fn process(&self, packet: &mut Packet<'_>) -> Result<Verdict, PipelineError>;

    /// Optional batch fast path. An implementation writes one verdict
    /// per packet and returns `Some`; the default `None` makes the
    /// pipeline fall back to per-packet [`Self::process`] calls.
    fn process_batch(
        &self,
        _packets: &mut [Packet<'_>],
        _verdicts: &mut [Verdict],
    ) -> Option<Result<(), PipelineError>> {
        None
    }

    /// Called once when the stage is added to a pipeline.
    fn init(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Called once when the pipeline is torn down.
    fn teardown(&self) {}
}

/// Counts every packet it sees and passes it on. Handy as a probe stage
/// and for capture loops that only need a tally.
#[derive(Debug, Default)]
pub struct CounterProcessor {
    seen: AtomicU64,
    log_every: Option<u64>,
}

impl CounterProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs a line every `n` packets.
    pub fn with_logging(n: u64) -> Self {
        CounterProcessor {
            seen: AtomicU64::new(0),
            log_every: Some(n.max(1)),
        }
    }

    pub fn count(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl Processor for CounterProcessor {
    fn process(&self, packet: &mut Packet<'_>) -> Result<Verdict, PipelineError> {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.log_every {
            if seen % every == 0 {
                let source = packet.source();
                log::info!(
                    "{seen} packets seen (last: {} bytes on ifindex {} queue {})",
                    packet.len(),
                    source.if_index,
                    source.queue_id
                );
            }
        }
        Ok(Verdict::pass())
    }
}
