//! privcap - ARP and BOOTP capture through privilege-separated workers.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use privcap::config::Config;
use privcap::inject::{arp_probe, Injector};
use privcap::ipc::ControlChannel;
use privcap::supervisor::{self, ExecLauncher, Interfaces, LoggingHandler, Supervisor};
use privcap::worker;

#[derive(Parser)]
#[command(name = "privcap")]
#[command(about = "Privilege-separated ARP and BOOTP capture")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture traffic on an interface
    Listen {
        /// Network interface to listen on (e.g., eth0)
        #[arg(short, long)]
        interface: String,
        /// Capture BOOTP/DHCP replies
        #[arg(long)]
        bootp: bool,
        /// Capture ARP traffic for an address (repeatable)
        #[arg(long, value_name = "ADDR")]
        arp: Vec<Ipv4Addr>,
        /// Send an ARP probe for each --arp address once its worker is up
        #[arg(long)]
        probe: bool,
        /// Log frame lengths and flags
        #[arg(short, long)]
        verbose: bool,
    },
    /// List network interfaces
    Interfaces,
    /// Run a capture worker (started by `listen`)
    #[command(hide = true)]
    Worker {
        /// Descriptor holding the control channel
        #[arg(long)]
        fd: RawFd,
    },
}

struct ListenArgs {
    interface: String,
    bootp: bool,
    arp: Vec<Ipv4Addr>,
    probe: bool,
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Worker { fd } => worker::run(fd, &config),
        Commands::Interfaces => {
            for ifp in Interfaces::discover().iter() {
                println!("{}", ifp);
            }
            ExitCode::SUCCESS
        }
        Commands::Listen {
            interface,
            bootp,
            arp,
            probe,
            verbose,
        } => {
            let args = ListenArgs {
                interface,
                bootp,
                arp,
                probe,
                verbose,
            };
            match listen(args) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn listen(args: ListenArgs) -> Result<()> {
    if !args.bootp && args.arp.is_empty() {
        bail!("Nothing to capture: pass --bootp and/or --arp <ADDR>");
    }

    let interfaces = Interfaces::discover();
    let ifp = interfaces
        .find_by_name(&args.interface)
        .cloned()
        .with_context(|| format!("Interface not found: {}", args.interface))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    let local = LocalSet::new();

    local.block_on(&runtime, async move {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (client, server) = ControlChannel::pair().context("Failed to create root channel")?;
        tokio::task::spawn_local(supervisor::watch_root(server, events_tx.clone()));

        let launcher = ExecLauncher::new(events_tx).context("Failed to locate own executable")?;
        let handler = LoggingHandler::new().with_verbose(args.verbose);
        let mut supervisor = Supervisor::new(interfaces, launcher, handler);

        let injector = Injector::new(client);
        if args.bootp {
            injector.open_bootp(&ifp).context("Failed to open BOOTP worker")?;
        }
        for addr in &args.arp {
            injector
                .open_arp(&ifp, *addr)
                .with_context(|| format!("Failed to open ARP worker for {}", addr))?;
            if args.probe {
                injector
                    .send_arp(&ifp, *addr, &arp_probe(&ifp, *addr))
                    .with_context(|| format!("Failed to queue ARP probe for {}", addr))?;
            }
        }

        info!("Listening on {}", ifp);
        supervisor.run(events_rx).await?;
        drop(injector);
        info!("Stopped");
        Ok(())
    })
}
