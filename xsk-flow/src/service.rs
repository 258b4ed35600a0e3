//! # Packet service
//!
//! ## Purpose
//!
//! [`Service`] wires the whole stack together: it resolves the
//! configured interface names, builds one socket per (interface, queue)
//! pair, registers each with a shared redirect program, attaches the
//! program once per distinct interface, and runs one worker thread per
//! socket.
//!
//! ## How it works
//!
//! Each worker waits for readability, drains up to a batch of RX
//! descriptors, wraps them as packet views, runs the pipeline, and
//! applies the verdicts: drops are counted and their frames re-donated,
//! passes likewise, transmits on the worker's own socket go out
//! zero-copy through its TX ring, and transmits targeting another bound
//! socket are copied out and delivered under that socket's lock.
//! Every frame that does not leave through the local TX ring returns to
//! the Fill ring before the next iteration; frames that do leave come
//! back through the Completion ring and are recycled there.
//!
//! Workers never take two socket locks at once: cross-socket frames are
//! copied to heap buffers while the own lock is held and sent after it
//! is released, which keeps each ring single-producer and rules out
//! lock cycles.
//!
//! Teardown reverses construction: stop the workers, detach the program
//! from each distinct interface (best effort), unregister the queues,
//! then let the sockets and the program drop.

use crate::packet::{Packet, PacketSource};
use crate::pipeline::{Pipeline, PipelineError};
use crate::processor::{PacketAction, Verdict};
use crate::stats::StatsCollector;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use xsk_socket::{netlink, RedirectProgram, SocketOptions, XdpDesc, XskSocket, XDP_FLAGS_DEFAULT};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,

    #[error("no interfaces configured")]
    NoInterfaces,

    #[error("unknown interface {0}")]
    UnknownInterface(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Socket(#[from] xsk_socket::XskError),

    #[error(transparent)]
    Redirect(#[from] xsk_socket::RedirectError),

    #[error(transparent)]
    Netlink(#[from] netlink::NetlinkError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// One interface to bind, with the RX queues to take over.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub name: String,
    pub queues: Vec<u32>,
}

impl InterfaceConfig {
    pub fn new(name: impl Into<String>, queues: Vec<u32>) -> Self {
        InterfaceConfig {
            name: name.into(),
            queues,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub interfaces: Vec<InterfaceConfig>,
    /// Applied to every socket.
    pub socket_options: SocketOptions,
    /// Attachment policy for the redirect program.
    pub xdp_flags: u32,
    /// Upper bound on packets processed per wake-up.
    pub batch_size: usize,
    pub collect_stats: bool,
    /// Upper bound on one readiness wait; also bounds how long a stop
    /// request can go unnoticed.
    pub poll_timeout_ms: i32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            interfaces: Vec::new(),
            socket_options: SocketOptions::default(),
            xdp_flags: XDP_FLAGS_DEFAULT,
            batch_size: 64,
            collect_stats: true,
            poll_timeout_ms: 100,
        }
    }
}

struct SocketRecord {
    socket: Mutex<XskSocket>,
    if_index: u32,
    queue_id: u32,
    if_name: String,
}

/// The assembled service. Construction allocates and binds everything;
/// [`Service::start`] spawns the workers and [`Service::stop`] joins
/// them. Dropping the service tears the kernel state down.
pub struct Service {
    // field order matters: workers are joined in Drop, the sockets
    // release before the program does
    workers: Vec<JoinHandle<()>>,
    records: Arc<Vec<SocketRecord>>,
    program: RedirectProgram,
    pipeline: Arc<Pipeline>,
    stats: Arc<StatsCollector>,
    running: Arc<AtomicBool>,
    config: ServiceConfig,
}

impl Service {
    pub fn new(config: ServiceConfig, pipeline: Arc<Pipeline>) -> Result<Self, ServiceError> {
        if config.interfaces.is_empty() {
            return Err(ServiceError::NoInterfaces);
        }
        let max_queue = config
            .interfaces
            .iter()
            .flat_map(|iface| iface.queues.iter().copied())
            .max()
            .unwrap_or(0);
        let mut program = RedirectProgram::new(max_queue + 1)?;

        let links = netlink::get_links()?;
        let mut records = Vec::new();
        for iface in &config.interfaces {
            let if_index = links
                .iter()
                .find(|link| link.name == iface.name)
                .map(|link| link.if_index)
                .ok_or_else(|| ServiceError::UnknownInterface(iface.name.clone()))?;
            for &queue_id in &iface.queues {
                let mut socket = XskSocket::new(if_index, queue_id, config.socket_options)?;
                program.register(queue_id, socket.raw_fd())?;
                let addrs: Vec<u64> = socket.fill_frame_addrs().collect();
                let donated = socket.fill(&addrs);
                log::debug!(
                    "{}:{queue_id}: socket bound, {donated} frames donated to the fill ring",
                    iface.name
                );
                records.push(SocketRecord {
                    socket: Mutex::new(socket),
                    if_index,
                    queue_id,
                    if_name: iface.name.clone(),
                });
            }
        }

        for if_index in distinct_interfaces(&records) {
            program.attach(if_index, config.xdp_flags)?;
            log::info!("redirect program attached to ifindex {if_index}");
        }

        Ok(Service {
            workers: Vec::new(),
            records: Arc::new(records),
            program,
            pipeline,
            stats: Arc::new(StatsCollector::new()),
            running: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn stats(&self) -> Arc<StatsCollector> {
        self.stats.clone()
    }

    /// A handle that flips the running flag from outside, for signal
    /// handlers and watchdogs.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns one worker per socket.
    pub fn start(&mut self) -> Result<(), ServiceError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning);
        }
        for index in 0..self.records.len() {
            let record = &self.records[index];
            let name = format!("xsk-{}:{}", record.if_name, record.queue_id);
            let ctx = WorkerCtx {
                records: self.records.clone(),
                index,
                pipeline: self.pipeline.clone(),
                stats: self.stats.clone(),
                running: self.running.clone(),
                batch_size: self.config.batch_size.max(1),
                poll_timeout_ms: self.config.poll_timeout_ms,
                collect_stats: self.config.collect_stats,
            };
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(ctx));
            match handle {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.stop();
                    return Err(ServiceError::Spawn(e));
                }
            }
        }
        log::info!("service started with {} workers", self.workers.len());
        Ok(())
    }

    /// Signals the workers to stop and joins them. Idempotent; a worker
    /// notices the flag within one poll timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("worker panicked");
                self.stats.record_error();
            }
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
        for if_index in distinct_interfaces(&self.records) {
            if let Err(e) = self.program.detach(if_index) {
                log::warn!("detach from ifindex {if_index} failed: {e}");
            }
        }
        let mut unregistered: Vec<u32> = Vec::new();
        for record in self.records.iter() {
            if unregistered.contains(&record.queue_id) {
                continue;
            }
            unregistered.push(record.queue_id);
            if let Err(e) = self.program.unregister(record.queue_id) {
                log::warn!("unregister of queue {} failed: {e}", record.queue_id);
            }
        }
    }
}

fn distinct_interfaces(records: &[SocketRecord]) -> Vec<u32> {
    let mut seen = Vec::new();
    for record in records {
        if !seen.contains(&record.if_index) {
            seen.push(record.if_index);
        }
    }
    seen
}

struct WorkerCtx {
    records: Arc<Vec<SocketRecord>>,
    index: usize,
    pipeline: Arc<Pipeline>,
    stats: Arc<StatsCollector>,
    running: Arc<AtomicBool>,
    batch_size: usize,
    poll_timeout_ms: i32,
    collect_stats: bool,
}

/// A frame copied out of the local UMEM, waiting to be sent on another
/// bound socket.
struct CrossFrame {
    if_index: u32,
    queue_id: u32,
    bytes: Vec<u8>,
}

fn worker_loop(ctx: WorkerCtx) {
    let record = &ctx.records[ctx.index];
    let source = PacketSource {
        if_index: record.if_index,
        queue_id: record.queue_id,
    };
    let mut descs = vec![XdpDesc::default(); ctx.batch_size];
    let mut crossings: Vec<CrossFrame> = Vec::new();
    // the descriptor never changes, so the readiness wait can happen
    // outside the lock and cross-socket senders are not held up by it
    let raw_fd = record.socket.lock().raw_fd();
    log::debug!("worker for {}:{} entering loop", record.if_name, record.queue_id);

    while ctx.running.load(Ordering::SeqCst) {
        let ready = match xsk_socket::socket::poll_fd_readable(raw_fd, ctx.poll_timeout_ms) {
            Ok(ready) => ready,
            Err(e) => {
                if ctx.collect_stats {
                    ctx.stats.record_error();
                }
                log::debug!("poll failed on {}:{}: {e}", record.if_name, record.queue_id);
                continue;
            }
        };
        if !ready {
            continue;
        }

        crossings.clear();
        {
            let mut socket = record.socket.lock();
            let drained = socket.rx(&mut descs);
            if drained == 0 {
                socket.reclaim_completions();
                continue;
            }

            if ctx.collect_stats {
                let bytes: u64 = descs[..drained].iter().map(|d| d.len as u64).sum();
                ctx.stats.record_rx(drained as u64, bytes);
            }

            let mut packets: Vec<Packet<'_>> = Vec::with_capacity(drained);
            for desc in &descs[..drained] {
                // frames drained from RX are exclusively user-owned and
                // distinct, per the ring protocol
                let data = unsafe { socket.frame_mut(desc.addr, desc.len as usize) };
                packets.push(Packet::new(data, *desc, source).with_timestamp(Instant::now()));
            }

            let mut verdicts: Vec<Verdict> = Vec::new();
            let surviving = match ctx.pipeline.process_batch(&mut packets, &mut verdicts) {
                Ok(surviving) => surviving,
                Err(e) => {
                    log::warn!("pipeline failed, dropping batch: {e}");
                    drop(packets);
                    if ctx.collect_stats {
                        ctx.stats.record_error();
                    }
                    let addrs: Vec<u64> = descs[..drained]
                        .iter()
                        .map(|d| socket.frame_base(d.addr))
                        .collect();
                    socket.fill(&addrs);
                    socket.reclaim_completions();
                    continue;
                }
            };

            let mut own_tx: Vec<XdpDesc> = Vec::new();
            let mut passed: u64 = 0;
            for (packet, verdict) in packets.iter().zip(verdicts.iter()) {
                match verdict.action {
                    PacketAction::Pass | PacketAction::Recirculate => passed += 1,
                    // terminal drops never survive the batch call
                    PacketAction::Drop => {}
                    PacketAction::Transmit { if_index, queue_id } => {
                        if if_index == record.if_index && queue_id == record.queue_id {
                            own_tx.push(packet.desc());
                        } else {
                            crossings.push(CrossFrame {
                                if_index,
                                queue_id,
                                bytes: packet.raw().to_vec(),
                            });
                        }
                    }
                }
            }
            drop(packets);

            let dropped = (drained - surviving) as u64;
            if ctx.collect_stats {
                ctx.stats.record_dropped(dropped);
                ctx.stats.record_passed(passed);
            }

            let queued = if own_tx.is_empty() {
                0
            } else {
                socket.tx(&own_tx)
            };
            if queued > 0 {
                if ctx.collect_stats {
                    let bytes: u64 = own_tx[..queued].iter().map(|d| d.len as u64).sum();
                    ctx.stats.record_tx(queued as u64, bytes);
                }
                if let Err(e) = socket.kick() {
                    if ctx.collect_stats {
                        ctx.stats.record_error();
                    }
                    log::debug!("kick failed on {}:{}: {e}", record.if_name, record.queue_id);
                }
            }

            // everything that did not leave through the local TX ring
            // goes back to the fill ring; TX frames come back through
            // the completion ring instead
            let mut refill: Vec<u64> = Vec::with_capacity(drained);
            for desc in &descs[..drained] {
                let base = socket.frame_base(desc.addr);
                let left_via_tx = own_tx[..queued]
                    .iter()
                    .any(|d| socket.frame_base(d.addr) == base);
                if !left_via_tx {
                    refill.push(base);
                }
            }
            if queued < own_tx.len() && ctx.collect_stats {
                // ring-full overflow: those frames were re-donated above
                ctx.stats.record_dropped((own_tx.len() - queued) as u64);
            }
            socket.fill(&refill);
            socket.reclaim_completions();
        }

        for crossing in crossings.drain(..) {
            let Some(target) = ctx
                .records
                .iter()
                .find(|r| r.if_index == crossing.if_index && r.queue_id == crossing.queue_id)
            else {
                if ctx.collect_stats {
                    ctx.stats.record_error();
                }
                log::debug!(
                    "transmit target {}:{} is not bound",
                    crossing.if_index,
                    crossing.queue_id
                );
                continue;
            };
            let mut socket = target.socket.lock();
            match socket.send_packets(&[crossing.bytes.as_slice()]) {
                Ok(1) => {
                    if ctx.collect_stats {
                        ctx.stats.record_tx(1, crossing.bytes.len() as u64);
                    }
                }
                Ok(_) => {
                    if ctx.collect_stats {
                        ctx.stats.record_dropped(1);
                    }
                }
                Err(e) => {
                    if ctx.collect_stats {
                        ctx.stats.record_error();
                    }
                    log::debug!(
                        "cross-socket send to {}:{} failed: {e}",
                        target.if_name,
                        target.queue_id
                    );
                }
            }
        }
    }
    log::debug!("worker for {}:{} exiting", record.if_name, record.queue_id);
}
