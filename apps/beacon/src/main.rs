use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use webrtc::ice_transport::ice_server::RTCIceServer;

use beacon_core::config::Config;
use beacon_core::media::webrtc::WebRtcEngineFactory;
use beacon_core::negotiation::Role;
use beacon_core::session::{RendezvousTicket, Session, SessionConfig};
use beacon_core::telemetry::logging::{self, LogConfig, LogLevel};
use signal_transport::{FrameConfig, SocketKind};

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Parser, Debug)]
#[command(name = "beacon", about = "Bootstrap a direct media session between two peers")]
struct Cli {
    /// Log verbosity
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Offer a session: print a rendezvous ticket and wait for a peer
    Host {
        /// Signaling port (random ephemeral port when omitted)
        #[arg(long)]
        port: Option<u16>,

        /// Address to advertise in the ticket (detected when omitted)
        #[arg(long)]
        address: Option<String>,

        /// Signal over TCP instead of UDP
        #[arg(long)]
        tcp: bool,

        /// Compress signaling payloads (both sides must agree)
        #[arg(long)]
        compress: bool,

        /// Frame delimiter for TCP signaling (both sides must agree)
        #[arg(long)]
        delimiter: Option<String>,
    },
    /// Join a session from a host's ticket (raw JSON, or @path to a file)
    Join {
        ticket: String,

        #[arg(long)]
        tcp: bool,

        #[arg(long)]
        compress: bool,

        #[arg(long)]
        delimiter: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("beacon: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("logger init failed")?;

    let config = Config::from_env();
    match cli.command {
        Command::Host {
            port,
            address,
            tcp,
            compress,
            delimiter,
        } => {
            let mut ticket = RendezvousTicket::for_local_host()?;
            if let Some(address) = address {
                ticket.address = address;
            }
            if let Some(port) = port {
                ticket.port = port;
            }
            println!("{}", ticket.to_json());
            run_session(Role::Offerer, ticket, &config, tcp, compress, delimiter).await
        }
        Command::Join {
            ticket,
            tcp,
            compress,
            delimiter,
        } => {
            let raw = match ticket.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("reading ticket file {path}"))?,
                None => ticket,
            };
            let ticket = RendezvousTicket::from_json(raw.trim())?;
            run_session(Role::Answerer, ticket, &config, tcp, compress, delimiter).await
        }
    }
}

async fn run_session(
    role: Role,
    ticket: RendezvousTicket,
    config: &Config,
    tcp: bool,
    compress: bool,
    delimiter: Option<String>,
) -> anyhow::Result<()> {
    let socket = if tcp {
        SocketKind::Stream
    } else {
        SocketKind::Datagram
    };
    let frame = FrameConfig {
        // Datagram boundaries frame messages on their own.
        delimiter: (socket == SocketKind::Stream)
            .then(|| delimiter.unwrap_or_else(|| config.delimiter.clone())),
        compression: compress || config.compression,
    };

    let factory = Arc::new(WebRtcEngineFactory::new(vec![RTCIceServer {
        urls: vec![STUN_SERVER.to_string()],
        ..Default::default()
    }]));

    let (session, handle) = Session::new(
        SessionConfig {
            role,
            endpoint: ticket.endpoint(),
            socket,
            frame,
            resend_interval: config.resend_interval,
            max_resend_attempts: config.max_resend_attempts,
            capture_interval: config.capture_interval,
        },
        factory,
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });

    session.run().await?;
    Ok(())
}
