// An implementation of the Trivial File Transfer Protocol (RFC 1350), client and server.
//
// Packets are encoded and decoded in `tftp`. A transfer moves one file in one direction in
// lock step: one DATA block is in flight at a time and the next one goes out only after the
// previous one is acknowledged. `processor` decides what to send next, `transfer` runs the
// socket loop with timeouts and retransmission. The server (`server`, `srv_conn`) spawns one
// such transfer per request on a socket of its own; the client (`client`) drives exactly one.
//
// Only octet mode is implemented, and option negotiation (OACK) is not.

pub mod client;
pub mod config;
pub mod processor;
pub mod root;
pub mod server;
pub mod srv_conn;
pub mod tftp;
pub mod transfer;

pub use client::Client;
pub use config::{ServerConfig, TransferConfig};
pub use server::{serve, Server};
pub use transfer::TransferError;
