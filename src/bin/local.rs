// The MIT License (MIT)

// Copyright (c) 2014 Y. T. CHUNG <zonyitoo@gmail.com>

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! `sslocal`: the SOCKS5-facing local proxy binary.

use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, warn};

use shadowsocks::config::{Config, RemoteAddr, ServerConfig};
use shadowsocks::crypto::CipherKind;

#[derive(Parser, Debug)]
#[command(name = "sslocal", about = "shadowsocks local SOCKS5 proxy", version)]
struct Cli {
    /// Upstream relay server host (repeatable for multiple relays, load-balanced).
    #[arg(short = 's', long = "server-addr")]
    server: Vec<String>,

    /// Upstream relay server port, shared by every `-s` host.
    #[arg(short = 'p', long = "server-port")]
    server_port: Option<u16>,

    /// Local SOCKS5 bind address.
    #[arg(short = 'b', long = "local-addr")]
    local_addr: Option<IpAddr>,

    /// Local SOCKS5 bind port.
    #[arg(short = 'l', long = "local-port")]
    local_port: Option<u16>,

    /// Shared password for every configured upstream relay.
    #[arg(short = 'k', long = "password")]
    password: Option<String>,

    /// Cipher method, shared by every configured upstream relay.
    #[arg(short = 'm', long = "encrypt-method")]
    method: Option<String>,

    /// Per-connection connect/idle timeout, in seconds.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// PID file path; written on startup and removed on clean shutdown.
    #[arg(short = 'f', long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Outbound network interface to bind upstream sockets to.
    #[arg(short = 'i', long = "interface")]
    interface: Option<String>,

    /// User to drop privileges to after binding (not implemented by this crate).
    #[arg(short = 'a', long = "user")]
    user: Option<String>,

    /// Enable the UDP ASSOCIATE stub.
    #[arg(short = 'u', long = "udp-relay")]
    udp_relay: bool,

    /// Increase verbosity; repeatable.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON configuration file, merged with (and overridden by) the flags above.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Enable TCP Fast Open for upstream connects.
    #[arg(long = "fast-open")]
    fast_open: bool,

    /// ACL file path; destinations it lists bypass the relay.
    #[arg(long = "acl")]
    acl: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config = match assemble_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(user) = &cli.user {
        warn!("-a/--user ({user}) was given but privilege drop is not implemented by this crate");
    }

    if let Some(pid_file) = &cli.pid_file {
        if let Err(err) = write_pid_file(pid_file) {
            error!("failed to write pid file {}: {err}", pid_file.display());
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(shadowsocks::run(config));

    if let Some(pid_file) = &cli.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn assemble_config(cli: &Cli) -> Result<Config, String> {
    let mut config = Config::default();

    if let Some(path) = &cli.config {
        config.merge_file(path).map_err(|e| e.to_string())?;
    }

    if !cli.server.is_empty() {
        let port = cli.server_port.ok_or("a server port (-p) is required when -s is given")?;
        let password = cli.password.clone().ok_or("a password (-k) is required when -s is given")?;
        let method_name = cli.method.as_deref().unwrap_or("aes-256-gcm");
        let method: CipherKind = method_name.parse().map_err(|_| format!("unsupported cipher method: {method_name}"))?;

        config.servers = cli
            .server
            .iter()
            .map(|host| {
                let addr = match host.parse::<IpAddr>() {
                    Ok(ip) => RemoteAddr::SocketAddr((ip, port).into()),
                    Err(_) => RemoteAddr::DomainName(host.clone(), port),
                };
                ServerConfig { addr, password: password.clone(), method }
            })
            .collect();
    }

    if let Some(addr) = cli.local_addr {
        config.local_addr = addr;
    }
    if let Some(port) = cli.local_port {
        config.local_port = port;
    }
    if let Some(secs) = cli.timeout {
        config.timeout = Duration::from_secs(secs);
    }
    config.udp_relay |= cli.udp_relay;
    config.fast_open |= cli.fast_open;
    if cli.interface.is_some() {
        config.interface = cli.interface.clone();
    }
    if cli.acl.is_some() {
        config.acl_path = cli.acl.clone();
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn write_pid_file(path: &PathBuf) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    write!(file, "{}", std::process::id())
}

/// `-v`-repeat-count to level, the same shape the teacher's binaries use: quiet by
/// default, `warn` at one `-v`, up through `trace` at four or more.
fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_env("RUST_LOG").init();
}
