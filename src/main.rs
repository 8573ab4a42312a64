// rtftpd: a TFTP server compliant with RFC 1350.
//
// Transfer begins with a request to read or write a file. If the server grants it, the file is
// sent in blocks of 512 bytes, each of which must be acknowledged before the next one goes
// out. A block shorter than 512 bytes ends the transfer. Every request is answered from a
// fresh port, which identifies the transfer from then on.
//
// Error codes
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 6    File already exists
// 7    No such user
//
// An RRQ with an empty filename returns a listing of the served directory.

use anyhow::{Context, Result};
use clap::Parser;
use rtftp::{Server, ServerConfig, TransferConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Serve a directory over TFTP.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to serve. Requests cannot reach outside of it.
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// UDP port to listen on.
    #[arg(short, long, default_value_t = rtftp::config::DEFAULT_PORT)]
    port: u16,

    /// Address to bind.
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Seconds to wait for a reply before resending or giving up.
    #[arg(short, long, default_value_t = rtftp::config::DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// How many times the same packet is resent before a transfer is abandoned.
    #[arg(long, default_value_t = rtftp::config::DEFAULT_MAX_RETRIES)]
    retries: u32,

    /// Refuse all write requests.
    #[arg(long)]
    read_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig {
        root: args.root,
        bind: args.bind,
        port: args.port,
        read_only: args.read_only,
        transfer: TransferConfig {
            timeout: Duration::from_secs(args.timeout),
            max_retries: args.retries,
        },
    };

    let listen = config.listen_addr();
    let server =
        Server::bind(config).with_context(|| format!("Could not start server on {listen}"))?;
    server.run().await.context("Listening socket failed")?;
    Ok(())
}
