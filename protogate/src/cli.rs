//! # CLI
//!
//! This module defines the command-line interface of `protogate` using `clap`.
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "protogate", version, about = "HTTP/JSON to gRPC transcoding gateway")]
pub struct Cli {
    /// Path to the gateway configuration file (JSON)
    #[arg(
        long,
        global = true,
        env = "PROTOGATE_CONFIG",
        default_value = "protogate.json"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bind every route and start serving HTTP traffic
    ///
    /// All routes are bound before the listener opens; a single invalid route aborts startup.
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// protogate --config gateway.json serve --listen 127.0.0.1:8080
    /// ```
    Serve {
        /// Address to listen on, overriding the configured one
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Validate the configuration and exit
    ///
    /// Binds every route against its descriptor set and schema and reports each failure.
    Check {
        /// Also open a channel to every upstream
        #[arg(long)]
        connect: bool,
    },
}
