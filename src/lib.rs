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

//! `shadowsocks`: the local-side SOCKS5-to-encrypted-tunnel proxy.
//!
//! The engine is built from five cooperating pieces — [`relay::tcprelay::local`] (the
//! Listener and per-connection Session), [`relay::tcprelay::registry`] (the shutdown
//! lifecycle), [`crypto`] (cipher contexts), [`acl`] (bypass decisions), and
//! [`config`]/[`context`] (the configuration every Session reads). [`run_local`] is the
//! library entry point: give it a single upstream relay's details and it runs the
//! Listener to completion.

pub mod acl;
pub mod config;
pub mod context;
pub mod crypto;
pub mod monitor;
pub mod relay;

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use config::{Config, RemoteAddr, ServerConfig};
use context::Context;
use crypto::CipherKind;
use relay::tcprelay::registry::SessionRegistry;

/// A single-upstream configuration for embedding this crate as a library, matching the
/// field set a host program assembles from its own CLI/config layer before handing
/// control to [`run_local`].
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub password: String,
    pub method: CipherKind,
    pub timeout: Duration,
    pub udp_relay: bool,
    pub fast_open: bool,
    pub verbose: u8,
    pub acl: Option<PathBuf>,
}

impl Default for LocalConfig {
    fn default() -> LocalConfig {
        LocalConfig {
            remote_host: String::new(),
            remote_port: 0,
            local_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 1080,
            password: String::new(),
            method: CipherKind::Aes256Gcm,
            timeout: Duration::from_secs(10),
            udp_relay: false,
            fast_open: false,
            verbose: 0,
            acl: None,
        }
    }
}

impl LocalConfig {
    fn into_config(self) -> Config {
        let addr = match self.remote_host.parse::<IpAddr>() {
            Ok(ip) => RemoteAddr::SocketAddr((ip, self.remote_port).into()),
            Err(_) => RemoteAddr::DomainName(self.remote_host, self.remote_port),
        };

        Config {
            servers: vec![ServerConfig { addr, password: self.password, method: self.method }],
            local_addr: self.local_addr,
            local_port: self.local_port,
            timeout: self.timeout,
            udp_relay: self.udp_relay,
            fast_open: self.fast_open,
            interface: None,
            acl_path: self.acl,
        }
    }
}

/// Runs a single-upstream Listener to completion, per the spec's library entry point.
/// Returns once a shutdown signal has drained every Session (see [`monitor`]).
pub async fn run_local(config: LocalConfig) -> io::Result<()> {
    run(config.into_config()).await
}

/// Runs the full multi-upstream Listener described by `config` to completion. This is
/// what the `sslocal` binary calls after merging CLI flags and an optional config file;
/// [`run_local`] is a thin single-server wrapper around the same engine.
pub async fn run(config: Config) -> io::Result<()> {
    config.validate().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let acl = match &config.acl_path {
        Some(path) => Some(acl::Acl::load(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?),
        None => None,
    };

    let ctx = Context::new(config, acl);
    let registry = Arc::new(SessionRegistry::new());
    let listener_shutdown = CancellationToken::new();

    let listener_task = tokio::spawn(relay::tcprelay::local::run(ctx.clone(), registry.clone(), listener_shutdown.clone()));
    let monitor_task = tokio::spawn(monitor::wait_for_shutdown(listener_shutdown, registry));

    // The listener only returns once `listener_shutdown` is cancelled, which the monitor
    // task does after observing a signal; wait for the monitor afterwards too, since it
    // still has to drain the registry before shutdown is actually complete.
    let listener_result = listener_task.await.expect("listener task panicked");
    monitor_task.await.expect("monitor task panicked");
    listener_result
}
