//! # owserver-compatible Server
//!
//! Command line front end for [`ownet_server`](https://docs.rs/ownet-server/), serving
//! either a simulated one-wire network or the tree of another owserver.
//!
//! ## Overview
//!
//! Without a backend subcommand a small simulated network is served: one bus with a
//! thermometer and a switch. The `remote` subcommand forwards every query to an upstream
//! server. Forwarded requests carry this server's anti-loop token, so chains of servers
//! still detect forwarding loops.
//!
//! ```text
//! owserver-sim --port 4304 simulated --buses 2 --thermometers 4 --latency-ms 750
//! owserver-sim --port 4305 remote 127.0.0.1:4304
//! owserver-sim --side 127.0.0.1:4310    copies all traffic to a side-tap listener
//! ```
pub mod backends;

use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use ownet_server::{
    DeviceTree,
    locks::LockRegistry,
    server::{Builder, Server},
};

use crate::backends::{remote::RemoteTree, simulated::SimulatedBus};

#[derive(Parser, Eq, PartialEq, Clone, Debug)]
enum Backend {
    /// Serve an in-memory network of thermometers and switches
    Simulated {
        #[arg(short, long, default_value = "1")]
        buses: u32,
        #[arg(short, long, default_value = "1")]
        thermometers: usize,
        #[arg(short, long, default_value = "1")]
        switches: usize,
        #[arg(
            short,
            long,
            help = "Duration of one bus transaction in milliseconds",
            default_value = "0"
        )]
        latency_ms: u64,
    },
    /// Forward every query to another owserver
    Remote {
        /// Address of the upstream server, e.g. 192.168.1.10:4304
        server: String,
    },
}

#[derive(Parser, Debug)]
#[command(about = "One-wire network server compatible with owserver", long_about=None)]
struct Args {
    #[arg(short, long, default_value = "4304")]
    port: u16,

    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    #[arg(
        long,
        help = "Maximum number of persistent connections",
        default_value = "20"
    )]
    max_persistent: usize,

    #[arg(
        long,
        help = "Idle persistent connections linger only below this many",
        default_value = "10"
    )]
    min_persistent: usize,

    #[arg(long, help = "Never keep connections open between requests")]
    no_persistence: bool,

    #[arg(
        long,
        help = "Seconds a new connection may take to send its request",
        default_value = "10"
    )]
    timeout_server: u64,

    #[arg(long, help = "Send a keep-alive before working on each request")]
    ping_crazy: bool,

    #[arg(long, value_name = "ADDR", help = "Copy all traffic to a side-tap listener")]
    side: Option<SocketAddr>,

    #[clap(subcommand)]
    backend: Option<Backend>,
}

impl Args {
    fn builder(&self) -> Builder {
        let builder = Builder::new()
            .max_persistent(self.max_persistent)
            .min_persistent(self.min_persistent)
            .no_persistence(self.no_persistence)
            .request_timeout(Duration::from_secs(self.timeout_server))
            .ping_crazy(self.ping_crazy);
        match self.side {
            Some(side) => builder.side_tap(side),
            None => builder,
        }
    }
}

/// Serves until the listener fails or the process is interrupted.
async fn run<T: DeviceTree>(server: Server<T>, addr: SocketAddr) -> Result<(), Box<dyn Error>> {
    tokio::select! {
        result = server.listen(addr) => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted, shutting down"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting one-wire server");

    let args = Args::parse();
    log::debug!("Parsed arguments: ip={}, port={}", args.ip, args.port);

    let addr = SocketAddr::new(args.ip, args.port);
    log::info!("Binding to address: {}", addr);

    let builder = args.builder();
    match args.backend.unwrap_or(Backend::Simulated {
        buses: 1,
        thermometers: 1,
        switches: 1,
        latency_ms: 0,
    }) {
        Backend::Simulated {
            buses,
            thermometers,
            switches,
            latency_ms,
        } => {
            log::info!(
                "Simulating {} buses with {} thermometers and {} switches",
                buses,
                thermometers,
                switches
            );
            // The tree reports bus usage from the server's own locks
            let locks = Arc::new(LockRegistry::new());
            let tree = SimulatedBus::new(
                buses,
                thermometers,
                switches,
                Duration::from_millis(latency_ms),
            )
            .with_bus_stats(Arc::clone(&locks));
            run(builder.locks(locks).build(tree), addr).await
        }
        Backend::Remote { server } => {
            log::info!("Forwarding queries to {}", server);
            let tree = RemoteTree::new(server.as_str())?;
            run(builder.build(tree), addr).await
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Args, Backend};
    use clap::Parser;

    #[test]
    fn defaults_match_owserver() {
        let args = Args::parse_from(["owserver-sim"]);
        assert_eq!(args.port, 4304);
        assert_eq!(args.max_persistent, 20);
        assert_eq!(args.min_persistent, 10);
        assert!(!args.no_persistence);
        assert_eq!(args.side, None);
        assert_eq!(args.backend, None);
    }

    #[test]
    fn side_tap_takes_a_socket_address() {
        let args = Args::parse_from(["owserver-sim", "--side", "127.0.0.1:4310"]);
        assert_eq!(args.side, Some("127.0.0.1:4310".parse().unwrap()));
        assert!(Args::try_parse_from(["owserver-sim", "--side", "nowhere"]).is_err());
    }

    #[test]
    fn remote_backend_takes_an_address() {
        let args = Args::parse_from(["owserver-sim", "--ping-crazy", "remote", "10.0.0.1:4304"]);
        assert!(args.ping_crazy);
        assert_eq!(
            args.backend,
            Some(Backend::Remote {
                server: "10.0.0.1:4304".to_string()
            })
        );
    }
}
