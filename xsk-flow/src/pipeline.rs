//! # Processor pipeline
//!
//! ## Purpose
//!
//! An ordered chain of processors plus the routing policy between them.
//! Per packet, the chain walks stage by stage: `Pass` advances, `Drop`
//! terminates or continues depending on policy, `Transmit` terminates
//! with the target, and `Recirculate` restarts from the first stage
//! under a bounded re-entry counter.
//!
//! ## How it works
//!
//! The batch path initialises every verdict to `Pass` and feeds each
//! stage the active prefix, using the stage's batch hook when it has one
//! and per-packet dispatch otherwise. After each stage the arrays are
//! compacted in place: dropped packets are overwritten by survivors with
//! relative order preserved, transmit-terminated packets move behind the
//! active set but stay among the survivors, and recirculating packets
//! resolve through the scalar path before rejoining or leaving.

use crate::packet::{Packet, PacketError};
use crate::processor::{PacketAction, Processor, Verdict};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The stage list is full.
    #[error("pipeline is limited to {max} stages")]
    TooManyStages { max: usize },

    /// A processor reported a failure of its own.
    #[error("processor failed: {0}")]
    Processor(String),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Routing policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// A `Drop` verdict terminates the packet instead of deferring to
    /// later stages.
    pub stop_on_drop: bool,
    /// Whether stages may change packet bytes. A verdict flagged as
    /// modified while this is off is coerced to `Drop`.
    pub allow_modification: bool,
    /// Upper bound on the stage count, and on re-entries per packet.
    pub max_stages: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            stop_on_drop: true,
            allow_modification: true,
            max_stages: 16,
        }
    }
}

/// An ordered chain of processors.
///
/// The chain itself holds no locks. Sharing one instance across workers
/// is sound only when every referenced processor is reentrant; workers
/// with stateful, non-reentrant processors get their own instance.
pub struct Pipeline {
    stages: Vec<Box<dyn Processor>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline {
            stages: Vec::new(),
            config,
        }
    }

    /// Builds a pipeline from a stage list in one go.
    pub fn with_stages(
        config: PipelineConfig,
        stages: Vec<Box<dyn Processor>>,
    ) -> Result<Self, PipelineError> {
        let mut pipeline = Pipeline::new(config);
        for stage in stages {
            pipeline.add_stage(stage)?;
        }
        Ok(pipeline)
    }

    /// Appends a stage and runs its `init` hook.
    pub fn add_stage(&mut self, stage: Box<dyn Processor>) -> Result<(), PipelineError> {
        if self.stages.len() >= self.config.max_stages {
            return Err(PipelineError::TooManyStages {
                max: self.config.max_stages,
            });
        }
        stage.init()?;
        self.stages.push(stage);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one packet through the chain and returns the terminal
    /// action: `Pass`, `Drop` or `Transmit`. Recirculation happens
    /// inside and never escapes.
    pub fn process(&self, packet: &mut Packet<'_>) -> Result<PacketAction, PipelineError> {
        let mut recirculations = 0usize;
        'reentry: loop {
            let mut last = PacketAction::Pass;
            for stage in &self.stages {
                let verdict = self.run_stage(stage.as_ref(), packet)?;
                last = verdict.action;
                match verdict.action {
                    PacketAction::Pass => {}
                    PacketAction::Drop => {
                        if self.config.stop_on_drop {
                            return Ok(PacketAction::Drop);
                        }
                    }
                    PacketAction::Transmit { .. } => return Ok(verdict.action),
                    PacketAction::Recirculate => {
                        recirculations += 1;
                        if recirculations > self.config.max_stages {
                            log::warn!(
                                "packet exceeded {} re-entries, dropping",
                                self.config.max_stages
                            );
                            return Ok(PacketAction::Drop);
                        }
                        continue 'reentry;
                    }
                }
            }
            return Ok(last);
        }
    }

    /// Runs a batch through the chain.
    ///
    /// On return `packets` and `verdicts` hold the survivors in order:
    /// first the packets that passed the whole chain, then the ones that
    /// terminated with a transmit target. Dropped packets are gone.
    /// Returns the surviving count.
    pub fn process_batch<'a>(
        &self,
        packets: &mut Vec<Packet<'a>>,
        verdicts: &mut Vec<Verdict>,
    ) -> Result<usize, PipelineError> {
        verdicts.clear();
        verdicts.resize(packets.len(), Verdict::pass());
        let mut finished: Vec<(Packet<'a>, Verdict)> = Vec::new();
        let stage_count = self.stages.len();

        for (stage_index, stage) in self.stages.iter().enumerate() {
            if packets.is_empty() {
                break;
            }
            let active = packets.len();
            match stage.process_batch(&mut packets[..active], &mut verdicts[..active]) {
                Some(result) => result?,
                None => {
                    for (packet, verdict) in
                        packets[..active].iter_mut().zip(verdicts[..active].iter_mut())
                    {
                        *verdict = stage.process(packet)?;
                    }
                }
            }
            if !self.config.allow_modification {
                for verdict in verdicts[..active].iter_mut() {
                    if verdict.modified {
                        log::warn!("stage modified a packet while modification is disabled");
                        *verdict = Verdict::drop();
                    }
                }
            }

            let last_stage = stage_index == stage_count - 1;
            let mut index = 0;
            while index < packets.len() {
                let verdict = verdicts[index];
                match verdict.action {
                    PacketAction::Pass => {
                        index += 1;
                    }
                    PacketAction::Drop => {
                        if self.config.stop_on_drop || last_stage {
                            packets.remove(index);
                            verdicts.remove(index);
                        } else {
                            // the next stage decides
                            index += 1;
                        }
                    }
                    PacketAction::Transmit { .. } => {
                        finished.push((packets.remove(index), verdict));
                        verdicts.remove(index);
                    }
                    PacketAction::Recirculate => {
                        let mut packet = packets.remove(index);
                        verdicts.remove(index);
                        match self.process(&mut packet)? {
                            PacketAction::Drop => {}
                            action @ PacketAction::Transmit { .. } => {
                                finished.push((
                                    packet,
                                    Verdict {
                                        action,
                                        modified: verdict.modified,
                                    },
                                ));
                            }
                            // completed the whole chain, nothing left to run
                            _ => finished.push((packet, Verdict::pass())),
                        }
                    }
                }
            }
        }

        // packets that ended the chain on a deferred Drop are terminal
        let mut index = 0;
        while index < packets.len() {
            if verdicts[index].action == PacketAction::Drop {
                packets.remove(index);
                verdicts.remove(index);
            } else {
                index += 1;
            }
        }

        for (packet, verdict) in finished {
            packets.push(packet);
            verdicts.push(verdict);
        }
        Ok(packets.len())
    }

    /// Tears the stages down in reverse order and empties the chain.
    pub fn teardown(&mut self) {
        for stage in self.stages.iter().rev() {
            stage.teardown();
        }
        self.stages.clear();
    }

    fn run_stage(
        &self,
        stage: &dyn Processor,
        packet: &mut Packet<'_>,
    ) -> Result<Verdict, PipelineError> {
        let verdict = stage.process(packet)?;
        if verdict.modified && !self.config.allow_modification {
            log::warn!("stage modified a packet while modification is disabled, dropping");
            return Ok(Verdict::drop());
        }
        Ok(verdict)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.stages.is_empty() {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketSource;
    use crate::processor::CounterProcessor;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use xsk_socket::XdpDesc;

    const SRC: PacketSource = PacketSource {
        if_index: 1,
        queue_id: 0,
    };

    /// Applies a fixed closure to every packet.
    struct FnStage<F>(F);

    impl<F> Processor for FnStage<F>
    where
        F: Fn(&mut Packet<'_>) -> Verdict + Send + Sync,
    {
        fn process(&self, packet: &mut Packet<'_>) -> Result<Verdict, PipelineError> {
            Ok((self.0)(packet))
        }
    }

    /// Records init/teardown ordering.
    struct LifecycleStage {
        events: &'static Mutex<Vec<&'static str>>,
        name: &'static str,
    }

    impl Processor for LifecycleStage {
        fn process(&self, _packet: &mut Packet<'_>) -> Result<Verdict, PipelineError> {
            Ok(Verdict::pass())
        }
        fn init(&self) -> Result<(), PipelineError> {
            self.events.lock().unwrap().push(self.name);
            Ok(())
        }
        fn teardown(&self) {
            self.events.lock().unwrap().push(self.name);
        }
    }

    fn make_batch<'a>(
        storage: &'a mut Vec<Vec<u8>>,
        count: usize,
    ) -> Vec<Packet<'a>> {
        *storage = (0..count)
            .map(|i| {
                let mut frame = vec![0u8; 64];
                frame[0] = i as u8;
                frame
            })
            .collect();
        storage
            .iter_mut()
            .map(|frame| {
                let desc = XdpDesc::new(0, frame.len() as u32);
                Packet::new(frame, desc, SRC)
            })
            .collect()
    }

    #[test]
    fn add_stage_enforces_the_limit() {
        let config = PipelineConfig {
            max_stages: 2,
            ..PipelineConfig::default()
        };
        let mut pipeline = Pipeline::new(config);
        pipeline.add_stage(Box::new(CounterProcessor::new())).unwrap();
        pipeline.add_stage(Box::new(CounterProcessor::new())).unwrap();
        assert!(matches!(
            pipeline.add_stage(Box::new(CounterProcessor::new())),
            Err(PipelineError::TooManyStages { max: 2 })
        ));
    }

    #[test]
    fn empty_pipeline_passes() {
        let pipeline = Pipeline::new(PipelineConfig::default());
        let mut frame = vec![0u8; 64];
        let desc = XdpDesc::new(0, 64);
        let mut packet = Packet::new(&mut frame, desc, SRC);
        assert_eq!(pipeline.process(&mut packet).unwrap(), PacketAction::Pass);
    }

    #[test]
    fn transmit_terminates_the_chain() {
        let after = std::sync::Arc::new(AtomicU64::new(0));
        let seen = after.clone();
        let pipeline = Pipeline::with_stages(
            PipelineConfig::default(),
            vec![
                Box::new(FnStage(|_: &mut Packet<'_>| Verdict::transmit(7, 0))),
                Box::new(FnStage(move |_: &mut Packet<'_>| {
                    seen.fetch_add(1, Ordering::Relaxed);
                    Verdict::pass()
                })),
            ],
        )
        .unwrap();
        let mut frame = vec![0u8; 64];
        let desc = XdpDesc::new(0, 64);
        let mut packet = Packet::new(&mut frame, desc, SRC);
        assert_eq!(
            pipeline.process(&mut packet).unwrap(),
            PacketAction::Transmit {
                if_index: 7,
                queue_id: 0
            }
        );
        assert_eq!(after.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn drop_without_stop_defers_to_later_stages() {
        let config = PipelineConfig {
            stop_on_drop: false,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::with_stages(
            config,
            vec![
                Box::new(FnStage(|_: &mut Packet<'_>| Verdict::drop())),
                Box::new(FnStage(|_: &mut Packet<'_>| Verdict::pass())),
            ],
        )
        .unwrap();
        let mut frame = vec![0u8; 64];
        let desc = XdpDesc::new(0, 64);
        let mut packet = Packet::new(&mut frame, desc, SRC);
        assert_eq!(pipeline.process(&mut packet).unwrap(), PacketAction::Pass);

        // when the dropping stage is last its verdict stands
        let pipeline = Pipeline::with_stages(
            config,
            vec![
                Box::new(FnStage(|_: &mut Packet<'_>| Verdict::pass())),
                Box::new(FnStage(|_: &mut Packet<'_>| Verdict::drop())),
            ],
        )
        .unwrap();
        let mut frame = vec![0u8; 64];
        let desc = XdpDesc::new(0, 64);
        let mut packet = Packet::new(&mut frame, desc, SRC);
        assert_eq!(pipeline.process(&mut packet).unwrap(), PacketAction::Drop);
    }

    #[test]
    fn recirculation_is_bounded() {
        let rounds = std::sync::Arc::new(AtomicU64::new(0));
        let counter = rounds.clone();
        let config = PipelineConfig {
            max_stages: 4,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::with_stages(
            config,
            vec![Box::new(FnStage(move |_: &mut Packet<'_>| {
                counter.fetch_add(1, Ordering::Relaxed);
                Verdict::recirculate()
            }))],
        )
        .unwrap();
        let mut frame = vec![0u8; 64];
        let desc = XdpDesc::new(0, 64);
        let mut packet = Packet::new(&mut frame, desc, SRC);
        assert_eq!(pipeline.process(&mut packet).unwrap(), PacketAction::Drop);
        // first pass plus max_stages re-entries
        assert_eq!(rounds.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn modification_policy_coerces_to_drop() {
        let config = PipelineConfig {
            allow_modification: false,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::with_stages(
            config,
            vec![Box::new(FnStage(|_: &mut Packet<'_>| {
                Verdict::pass().modified()
            }))],
        )
        .unwrap();
        let mut frame = vec![0u8; 64];
        let desc = XdpDesc::new(0, 64);
        let mut packet = Packet::new(&mut frame, desc, SRC);
        assert_eq!(pipeline.process(&mut packet).unwrap(), PacketAction::Drop);
    }

    #[test]
    fn batch_compaction_preserves_order() {
        // counter, drop-even filter, forwarder: of 8 packets the 4 odd
        // ones survive and reach the forwarder in order
        let counted = std::sync::Arc::new(AtomicU64::new(0));
        let forwarded: std::sync::Arc<Mutex<Vec<u8>>> =
            std::sync::Arc::new(Mutex::new(Vec::new()));
        let counter = counted.clone();
        let order = forwarded.clone();
        let pipeline = Pipeline::with_stages(
            PipelineConfig::default(),
            vec![
                Box::new(FnStage(move |_: &mut Packet<'_>| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Verdict::pass()
                })),
                Box::new(FnStage(|packet: &mut Packet<'_>| {
                    if packet.raw()[0] % 2 == 0 {
                        Verdict::drop()
                    } else {
                        Verdict::pass()
                    }
                })),
                Box::new(FnStage(move |packet: &mut Packet<'_>| {
                    order.lock().unwrap().push(packet.raw()[0]);
                    Verdict::transmit(2, 0)
                })),
            ],
        )
        .unwrap();

        let mut storage = Vec::new();
        let mut packets = make_batch(&mut storage, 8);
        let mut verdicts = Vec::new();
        let surviving = pipeline.process_batch(&mut packets, &mut verdicts).unwrap();

        assert_eq!(surviving, 4);
        assert_eq!(counted.load(Ordering::Relaxed), 8);
        assert_eq!(*forwarded.lock().unwrap(), vec![1, 3, 5, 7]);
        assert_eq!(packets.len(), 4);
        assert_eq!(verdicts.len(), 4);
        for verdict in &verdicts {
            assert_eq!(
                verdict.action,
                PacketAction::Transmit {
                    if_index: 2,
                    queue_id: 0
                }
            );
        }
        let survivors: Vec<u8> = packets.iter().map(|p| p.raw()[0]).collect();
        assert_eq!(survivors, vec![1, 3, 5, 7]);
    }

    #[test]
    fn batch_uses_the_stage_hook_when_present() {
        struct BatchDropAll(AtomicUsize);
        impl Processor for BatchDropAll {
            fn process(&self, _packet: &mut Packet<'_>) -> Result<Verdict, PipelineError> {
                panic!("batch hook must short-circuit per-packet dispatch");
            }
            fn process_batch(
                &self,
                packets: &mut [Packet<'_>],
                verdicts: &mut [Verdict],
            ) -> Option<Result<(), PipelineError>> {
                self.0.fetch_add(packets.len(), Ordering::Relaxed);
                for verdict in verdicts.iter_mut() {
                    *verdict = Verdict::drop();
                }
                Some(Ok(()))
            }
        }
        let pipeline = Pipeline::with_stages(
            PipelineConfig::default(),
            vec![Box::new(BatchDropAll(AtomicUsize::new(0)))],
        )
        .unwrap();
        let mut storage = Vec::new();
        let mut packets = make_batch(&mut storage, 5);
        let mut verdicts = Vec::new();
        let surviving = pipeline.process_batch(&mut packets, &mut verdicts).unwrap();
        assert_eq!(surviving, 0);
        assert!(packets.is_empty());
    }

    #[test]
    fn batch_recirculation_resolves_through_the_scalar_path() {
        // stage 1 recirculates each packet exactly once, stage 2 passes
        struct OnceAround(AtomicUsize);
        impl Processor for OnceAround {
            fn process(&self, packet: &mut Packet<'_>) -> Result<Verdict, PipelineError> {
                if packet.raw()[1] == 0 {
                    packet.payload()[1] = 1;
                    Ok(Verdict::recirculate())
                } else {
                    self.0.fetch_add(1, Ordering::Relaxed);
                    Ok(Verdict::pass())
                }
            }
        }
        let pipeline = Pipeline::with_stages(
            PipelineConfig::default(),
            vec![Box::new(OnceAround(AtomicUsize::new(0)))],
        )
        .unwrap();
        let mut storage = Vec::new();
        let mut packets = make_batch(&mut storage, 3);
        let mut verdicts = Vec::new();
        let surviving = pipeline.process_batch(&mut packets, &mut verdicts).unwrap();
        assert_eq!(surviving, 3);
        for verdict in &verdicts {
            assert_eq!(verdict.action, PacketAction::Pass);
        }
    }

    #[test]
    fn lifecycle_hooks_run_once_each() {
        static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        pipeline
            .add_stage(Box::new(LifecycleStage {
                events: &EVENTS,
                name: "a",
            }))
            .unwrap();
        pipeline
            .add_stage(Box::new(LifecycleStage {
                events: &EVENTS,
                name: "b",
            }))
            .unwrap();
        assert_eq!(*EVENTS.lock().unwrap(), vec!["a", "b"]);
        drop(pipeline);
        // teardown runs back to front, exactly once
        assert_eq!(*EVENTS.lock().unwrap(), vec!["a", "b", "b", "a"]);
    }
}
