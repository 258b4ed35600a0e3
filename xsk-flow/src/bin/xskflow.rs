//! Command-line front-end: interface listing and a single-socket capture
//! loop over the packet service.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xsk_flow::processor::CounterProcessor;
use xsk_flow::{
    InterfaceConfig, Packet, Pipeline, PipelineConfig, PipelineError, Processor, Service,
    ServiceConfig, Verdict,
};
use xsk_socket::netlink;

#[derive(Parser)]
#[command(name = "xskflow", about = "AF_XDP packet pipeline service", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List network interfaces and their indices.
    ListInterfaces,
    /// Capture packets on one interface queue until interrupted.
    Receive {
        /// Interface name to bind.
        #[arg(long, short)]
        interface: String,
        /// RX queue to take over.
        #[arg(long, short, default_value_t = 0)]
        queue: u32,
        /// Stop after this many packets.
        #[arg(long, short)]
        num_packets: Option<u64>,
        /// Fall back to generic (SKB) mode instead of driver mode.
        #[arg(long)]
        skb_mode: bool,
    },
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Command::ListInterfaces => list_interfaces(),
        Command::Receive {
            interface,
            queue,
            num_packets,
            skb_mode,
        } => receive(interface, queue, num_packets, skb_mode),
    }
}

fn list_interfaces() -> ExitCode {
    let links = match netlink::get_links() {
        Ok(links) => links,
        Err(e) => {
            log::error!("failed to enumerate interfaces: {e}");
            return ExitCode::FAILURE;
        }
    };
    for link in links {
        let mac = link
            .mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        println!("{:<3} {:<16} mtu {:<6} {mac}", link.if_index, link.name, link.mtu);
    }
    ExitCode::SUCCESS
}

fn receive(interface: String, queue: u32, num_packets: Option<u64>, skb_mode: bool) -> ExitCode {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }

    let counter = Arc::new(CounterProcessor::with_logging(1));
    let mut pipeline = Pipeline::new(PipelineConfig::default());
    if let Err(e) = pipeline.add_stage(Box::new(SharedCounter(counter.clone()))) {
        log::error!("failed to assemble pipeline: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = ServiceConfig {
        interfaces: vec![InterfaceConfig::new(interface.clone(), vec![queue])],
        ..ServiceConfig::default()
    };
    if skb_mode {
        config.xdp_flags =
            xsk_socket::XDP_FLAGS_SKB_MODE | xsk_socket::XDP_FLAGS_UPDATE_IF_NOEXIST;
    }

    let mut service = match Service::new(config, Arc::new(pipeline)) {
        Ok(service) => service,
        Err(e) => {
            log::error!("failed to build service on {interface}:{queue}: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = service.start() {
        log::error!("failed to start service: {e}");
        return ExitCode::FAILURE;
    }
    log::info!("capturing on {interface} queue {queue}, interrupt to stop");

    loop {
        std::thread::sleep(Duration::from_millis(200));
        if INTERRUPTED.load(Ordering::SeqCst) {
            break;
        }
        if let Some(limit) = num_packets {
            if counter.count() >= limit {
                break;
            }
        }
    }

    service.stop();
    let mut summary = String::new();
    if service.stats().snapshot().write_summary(&mut summary).is_ok() {
        log::info!("{summary}");
    }
    ExitCode::SUCCESS
}

/// Adapter that lets the capture loop keep a handle on the counter while
/// the pipeline owns the stage.
struct SharedCounter(Arc<CounterProcessor>);

impl Processor for SharedCounter {
    fn process(&self, packet: &mut Packet<'_>) -> Result<Verdict, PipelineError> {
        self.0.process(packet)
    }
}
