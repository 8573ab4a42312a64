// rtftp: a TFTP client.
//
//     rtftp [-p PORT] SERVER                          interactive shell
//     rtftp [-p PORT] SERVER get REMOTE [LOCAL]       download one file
//     rtftp [-p PORT] SERVER put LOCAL [REMOTE]       upload one file
//     rtftp [-p PORT] SERVER dir                      list the server's files

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rtftp::{Client, TransferConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "Exchange files with a TFTP server", long_about = None)]
struct Args {
    /// Server host name or IP address.
    server: String,

    /// Server port.
    #[arg(short, long, default_value_t = rtftp::config::DEFAULT_PORT)]
    port: u16,

    /// Seconds to wait for a reply before resending or giving up.
    #[arg(short, long, default_value_t = rtftp::config::DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download REMOTE and save it as LOCAL (defaults to REMOTE).
    Get { remote: String, local: Option<PathBuf> },
    /// Upload LOCAL and store it as REMOTE (defaults to LOCAL's file name).
    Put { local: PathBuf, remote: Option<String> },
    /// List the files on the server.
    Dir,
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Unknown server: {host}"))?
        .next()
        .ok_or_else(|| anyhow!("No address found for {host}"))
}

fn remote_name_for(local: &Path) -> Result<String> {
    local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("Cannot derive a remote name from {:?}", local))
}

async fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Get { remote, local } => {
            let local = local.unwrap_or_else(|| PathBuf::from(&remote));
            let bytes = client.get(&remote, &local).await?;
            println!("Received file '{remote}' {bytes} bytes.");
        }
        Command::Put { local, remote } => {
            let remote = match remote {
                Some(r) => r,
                None => remote_name_for(&local)?,
            };
            let bytes = client.put(&local, &remote).await?;
            println!("Sent file '{}' {bytes} bytes.", local.display());
        }
        Command::Dir => {
            client.dir(tokio::io::stdout()).await?;
        }
    }
    Ok(())
}

const HELP: &str = "\
Commands:
    get remote_file [local_file] - get a file from server and save it as local_file
    put local_file [remote_file] - send a file to server and store it as remote_file
    dir                          - obtain a listing of remote files
    help                         - show this message
    quit                         - exit TFTP client
";

async fn shell(client: &Client) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"tftp client> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            [] => continue,
            ["get", remote] => Command::Get { remote: remote.to_string(), local: None },
            ["get", remote, local] => {
                Command::Get { remote: remote.to_string(), local: Some(PathBuf::from(local)) }
            }
            ["put", local] => Command::Put { local: PathBuf::from(local), remote: None },
            ["put", local, remote] => {
                Command::Put { local: PathBuf::from(local), remote: Some(remote.to_string()) }
            }
            ["dir"] => Command::Dir,
            ["help"] => {
                print!("{HELP}");
                continue;
            }
            ["quit"] => break,
            _ => {
                println!("Unknown command: '{line}'");
                continue;
            }
        };

        if let Err(e) = run(client, command).await {
            println!("Error: {e:#}");
        }
    }

    println!("Exiting TFTP client.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let server = resolve(&args.server, args.port).await?;
    let config = TransferConfig {
        timeout: Duration::from_secs(args.timeout),
        ..TransferConfig::default()
    };
    let client = Client::with_config(server, config);

    match args.command {
        Some(command) => run(&client, command).await,
        None => {
            println!("Exchanging files with server '{}' ({})", args.server, server.ip());
            println!("Server port is {}\n", server.port());
            shell(&client).await
        }
    }
}
