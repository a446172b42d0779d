//! The read-only, `Arc`-shared snapshot every Session task references: configuration,
//! ACL tables, upstream selection RNG, and the one piece of mutable global state (the
//! TCP Fast Open support flag). Named after the teacher's own `context::Context`/
//! `SharedContext` split.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;

use crate::acl::Acl;
use crate::config::{Config, ServerConfig};

pub struct Context {
    config: Config,
    acl: Option<Acl>,
    rng: AsyncMutex<StdRng>,
    fastopen_supported: AtomicBool,
}

pub type SharedContext = Arc<Context>;

impl Context {
    pub fn new(config: Config, acl: Option<Acl>) -> SharedContext {
        Arc::new(Context {
            fastopen_supported: AtomicBool::new(config.fast_open),
            config,
            acl,
            rng: AsyncMutex::new(StdRng::from_entropy()),
        })
    }

    /// Test/library entry point that lets callers pin the RNG seed for deterministic
    /// upstream selection.
    pub fn with_seed(config: Config, acl: Option<Acl>, seed: u64) -> SharedContext {
        Arc::new(Context {
            fastopen_supported: AtomicBool::new(config.fast_open),
            config,
            acl,
            rng: AsyncMutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn acl(&self) -> Option<&Acl> {
        self.acl.as_ref()
    }

    /// Uniform-random draw of one upstream relay, the load-balancing policy in §4.3.
    pub async fn pick_server(&self) -> &ServerConfig {
        let mut rng = self.rng.lock().await;
        let idx = rng.gen_range(0..self.config.servers.len());
        &self.config.servers[idx]
    }

    pub fn fastopen_supported(&self) -> bool {
        self.config.fast_open && self.fastopen_supported.load(Ordering::Relaxed)
    }

    /// Flips the process-wide TFO-disable flag after an `ENOTCONN` from a Fast-Open
    /// connect attempt. Confined to loop-thread callers, per the concurrency model.
    pub fn disable_fastopen(&self) {
        self.fastopen_supported.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RemoteAddr, ServerConfig};
    use crate::crypto::CipherKind;

    fn two_server_config() -> Config {
        Config {
            servers: vec![
                ServerConfig {
                    addr: RemoteAddr::SocketAddr("10.0.0.1:8388".parse().unwrap()),
                    password: "a".into(),
                    method: CipherKind::Aes256Gcm,
                },
                ServerConfig {
                    addr: RemoteAddr::SocketAddr("10.0.0.2:8388".parse().unwrap()),
                    password: "b".into(),
                    method: CipherKind::Aes256Gcm,
                },
            ],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn pick_server_is_seeded_and_stays_within_range() {
        let ctx = Context::with_seed(two_server_config(), None, 42);
        for _ in 0..10 {
            let server = ctx.pick_server().await;
            assert!(matches!(&server.addr, RemoteAddr::SocketAddr(_)));
        }
    }

    #[test]
    fn fastopen_supported_follows_config_until_disabled() {
        let mut config = two_server_config();
        config.fast_open = true;
        let ctx = Context::new(config, None);
        assert!(ctx.fastopen_supported());

        ctx.disable_fastopen();
        assert!(!ctx.fastopen_supported());
    }

    #[test]
    fn fastopen_supported_is_false_when_config_never_enabled_it() {
        let config = two_server_config();
        let ctx = Context::new(config, None);
        assert!(!ctx.fastopen_supported());
        // Disabling an already-off flag is a no-op, not an error.
        ctx.disable_fastopen();
        assert!(!ctx.fastopen_supported());
    }
}
