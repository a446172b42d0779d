//! The per-connection Session: SOCKS5 negotiation, ACL decision, upstream connect (with
//! optional TCP Fast Open), and the full-duplex streaming loop. This is the engine the
//! system overview describes as five cooperating event sources; in the async
//! translation they are simply the `.await` points of one task.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::acl::Acl;
use crate::config::{Config, RemoteAddr, ServerConfig};
use crate::context::SharedContext;
use crate::crypto::{Cipher, CryptoMode};
use crate::relay::dns_resolver;
use crate::relay::fastopen::{self, Connected};
use crate::relay::socks5::{self, Address, Command};
use crate::relay::tcprelay::crypto_io::CryptoStream;
use crate::relay::tcprelay::BUFFER_SIZE;

/// Runs one Session end to end. Always returns `Ok(())`: every failure path is handled
/// internally by closing the Session (logging as appropriate), matching the spec's
/// "the Listener never dies on per-connection errors" guarantee — a Session's own
/// errors never propagate past this function. The negotiation stage (MethodSelect,
/// Request, Streaming, Closed) is never stored: it is simply where in this function's
/// control flow the task currently is.
///
/// Racing the whole of `drive_session` against `shutdown.cancelled()` — not just the
/// streaming phase — matters: a client that stalls mid-handshake (or a connect that's
/// stuck resolving/dialing) must not keep its Session registered forever, or a global
/// shutdown can never drain the registry (§4.6, invariant #6).
pub async fn run_session(ctx: SharedContext, client: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
    let result = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(()),
        result = drive_session(&ctx, client, peer) => result,
    };

    if let Err(err) = result {
        debug!("session with {peer} ended: {err}");
    }
}

async fn drive_session(ctx: &SharedContext, mut client: TcpStream, peer: SocketAddr) -> io::Result<()> {
    socks5::read_method_select_header(&mut client).await?;
    client.write_all(&socks5::method_select_reply()).await?;

    let request = match socks5::read_request(&mut client).await {
        Ok(req) => req,
        Err(err) => {
            warn!("{peer}: {err}");
            let _ = client.write_all(&socks5::error_reply(err.reply_code())).await;
            return Ok(());
        }
    };

    match request.command {
        Command::Connect => handle_connect(ctx, client, peer, request.address).await,
        Command::UdpAssociate if ctx.config().udp_relay => {
            info!("{peer}: UDP ASSOCIATE stub, relay enabled");
            let bound = client.local_addr()?;
            let _ = client.write_all(&socks5::udp_associate_reply(bound)).await;
            Ok(())
        }
        other => {
            warn!("{peer}: unsupported command {other:?}");
            let _ = client.write_all(&socks5::error_reply(socks5::REP_COMMAND_NOT_SUPPORTED)).await;
            Ok(())
        }
    }
}

async fn handle_connect(ctx: &SharedContext, mut client: TcpStream, peer: SocketAddr, address: Address) -> io::Result<()> {
    let direct = is_acl_bypass(ctx.acl(), &address);

    // Opportunistic, non-blocking grab of any bytes the client already queued behind
    // the request header in the same write — the "coalesced payload" case.
    let coalesced = read_coalesced_payload(&mut client)?;

    if direct {
        info!("{peer}: CONNECT {address} (direct, ACL bypass)");
        return handle_direct(ctx, client, address, coalesced).await;
    }

    info!("{peer}: CONNECT {address}");
    handle_relayed(ctx, client, address, coalesced).await
}

fn is_acl_bypass(acl: Option<&Acl>, address: &Address) -> bool {
    let Some(acl) = acl else { return false };
    match address {
        Address::SocketAddress(SocketAddr::V4(v4)) => acl.bypass_ipv4(*v4.ip()),
        Address::SocketAddress(SocketAddr::V6(_)) => false,
        Address::DomainNameAddress(domain, _) => acl.bypass_domain(domain),
    }
}

fn read_coalesced_payload(client: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = [0u8; BUFFER_SIZE];
    match client.try_read(&mut buf) {
        Ok(0) => Ok(Vec::new()),
        Ok(n) => Ok(buf[..n].to_vec()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

async fn handle_direct(ctx: &SharedContext, mut client: TcpStream, address: Address, coalesced: Vec<u8>) -> io::Result<()> {
    let config = ctx.config();
    let target = match with_timeout(config.timeout, dns_resolver::resolve(&address)).await {
        Ok(addr) => addr,
        Err(err) => {
            warn!("failed to resolve direct target {address}: {err}");
            return Ok(());
        }
    };

    let stream = match with_timeout(config.timeout, fastopen::connect_plain(target, config.interface.as_deref())).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to connect direct target {address}: {err}");
            return Ok(());
        }
    };

    client.write_all(&socks5::connect_success_reply()).await?;

    let mut upstream = CryptoStream::new(stream, None, None);
    if !coalesced.is_empty() {
        upstream.send(&coalesced).await?;
    }

    stream_loop(client, upstream, config).await
}

async fn handle_relayed(ctx: &SharedContext, mut client: TcpStream, address: Address, coalesced: Vec<u8>) -> io::Result<()> {
    let config = ctx.config();
    let server = ctx.pick_server().await.clone();

    let target = match with_timeout(config.timeout, resolve_server(&server)).await {
        Ok(addr) => addr,
        Err(err) => {
            warn!("failed to resolve upstream {}: {err}", server.addr);
            return Ok(());
        }
    };

    let mut header = address.to_header_bytes();
    header.extend_from_slice(&coalesced);

    let (stream, leftover, encrypt) = match connect_upstream(ctx, &server, target, &header).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!("failed to connect upstream {}: {err}", server.addr);
            return Ok(());
        }
    };

    client.write_all(&socks5::connect_success_reply()).await?;

    let decrypt = Cipher::new(server.method, &master_key(&server), CryptoMode::Decrypt);
    let mut upstream = CryptoStream::new(stream, Some(encrypt), Some(decrypt));
    if let Some(leftover) = leftover {
        // Already ciphertext from the connect step — goes straight to the wire, not
        // back through `encrypt` a second time.
        upstream.send_raw(&leftover).await?;
    }

    stream_loop(client, upstream, config).await
}

fn master_key(server: &ServerConfig) -> Vec<u8> {
    crate::crypto::derive_master_key(server.password.as_bytes(), server.method.key_len())
}

async fn resolve_server(server: &ServerConfig) -> io::Result<SocketAddr> {
    match &server.addr {
        RemoteAddr::SocketAddr(addr) => Ok(*addr),
        RemoteAddr::DomainName(host, port) => dns_resolver::resolve_host_port(host, *port).await,
    }
}

/// Connects to the chosen upstream relay, sending the shadowsocks header (and any
/// coalesced payload) encrypted as the first segment — atomically with the SYN if Fast
/// Open is enabled and supported. Returns the connected stream, any bytes of the first
/// encrypted segment that still need to be flushed once streaming begins, and the
/// encrypt cipher that produced it (its nonce counter has already advanced past chunk
/// zero, so the same instance must keep encrypting every chunk after it).
async fn connect_upstream(
    ctx: &SharedContext,
    server: &ServerConfig,
    target: SocketAddr,
    header_and_payload: &[u8],
) -> io::Result<(TcpStream, Option<Vec<u8>>, Cipher)> {
    let config = ctx.config();
    let mut encrypt = Cipher::new(server.method, &master_key(server), CryptoMode::Encrypt);
    let mut first_segment = Vec::new();
    encrypt.update(header_and_payload, &mut first_segment)?;

    if ctx.fastopen_supported() {
        match with_timeout(config.timeout, fastopen::connect_fastopen(target, config.interface.as_deref(), &first_segment))
            .await
        {
            Ok(Connected { stream, sent }) => {
                let leftover = if sent < first_segment.len() { Some(first_segment[sent..].to_vec()) } else { None };
                return Ok((stream, leftover, encrypt));
            }
            Err(err) if fastopen::is_fastopen_unsupported(&err) => {
                warn!("TCP Fast Open is not supported by this kernel; disabling it");
                ctx.disable_fastopen();
            }
            Err(err) => return Err(err),
        }
    }

    let stream = with_timeout(config.timeout, fastopen::connect_plain(target, config.interface.as_deref())).await?;
    Ok((stream, Some(first_segment), encrypt))
}

async fn with_timeout<T>(timeout: Duration, fut: impl std::future::Future<Output = io::Result<T>>) -> io::Result<T> {
    match time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

/// The steady-state full-duplex relay (§4.4). The client-to-upstream and
/// upstream-to-client directions are two independently polled futures raced in a single
/// `tokio::select!`, not two arms of one loop: each direction's socket half is split off
/// (`CryptoStream::into_split`) and owned exclusively by its own future, so a write
/// stalled under backpressure on one direction can never stop the other direction's
/// future from being polled. A single alternating loop cannot give this guarantee,
/// because once a `select!` arm's body starts running it holds the task until that body
/// awaits its own completion — exactly the head-of-line block this split avoids.
///
/// The idle timer (§4.5) lives inside the upstream-to-client future, since it is reset
/// only by upstream receive activity (the Upstream half owns it in the data model); it
/// fires the same close path as a clean EOF or I/O error on either direction.
async fn stream_loop(client: TcpStream, upstream: CryptoStream, config: &Config) -> io::Result<()> {
    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    let client_to_upstream = async move {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            let n = client_rd.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            upstream_wr.send(&buf[..n]).await?;
        }
    };

    let upstream_to_client = async move {
        let idle_timeout = config.idle_timeout();
        let idle = time::sleep_until(Instant::now() + idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;

                _ = &mut idle => {
                    debug!("session idle for {idle_timeout:?}, closing");
                    return Ok(());
                }

                result = upstream_rd.recv() => {
                    match result? {
                        None => return Ok(()),
                        Some(data) => {
                            if !data.is_empty() {
                                client_wr.write_all(&data).await?;
                            }
                            idle.as_mut().reset(Instant::now() + idle_timeout);
                        }
                    }
                }
            }
        }
    };

    tokio::select! {
        result = client_to_upstream => result,
        result = upstream_to_client => result,
    }
}
