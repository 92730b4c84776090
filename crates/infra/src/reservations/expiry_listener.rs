//! Redis keyspace-notification listener.
//!
//! Subscribes to `__keyevent@*__:expired`, picks out the reservation shadow
//! keys (`{p}:ttl:<order_id>`) and forwards the order ids to the sweeper. Redis
//! pub/sub is not durable: a missed event only delays compensation until the
//! next periodic scan.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use stockhold_core::OrderId;

use crate::sweeper::ExpiryNotifier;

const EXPIRED_EVENTS: &str = "__keyevent@*__:expired";

/// Handle to control and join the listener thread.
#[derive(Debug)]
pub struct RedisExpiryListenerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl RedisExpiryListenerHandle {
    /// Request shutdown and wait for the thread (at most one poll interval).
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisExpiryListener {
    client: redis::Client,
    ttl_key_prefix: String,
    /// Run `CONFIG SET notify-keyspace-events Ex` on connect.
    configure_server: bool,
    poll: Duration,
    max_backoff: Duration,
}

impl RedisExpiryListener {
    pub fn new(redis_url: &str, ttl_key_prefix: impl Into<String>) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            ttl_key_prefix: ttl_key_prefix.into(),
            configure_server: false,
            poll: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        })
    }

    pub fn configure_server(mut self, enabled: bool) -> Self {
        self.configure_server = enabled;
        self
    }

    /// Order id encoded in an expired key name, if it is one of ours.
    pub fn order_id_from_key(&self, key: &str) -> Option<OrderId> {
        key.strip_prefix(&self.ttl_key_prefix)?.parse().ok()
    }

    pub fn spawn(self, notifier: ExpiryNotifier) -> std::io::Result<RedisExpiryListenerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("redis-expiry-listener".to_string())
            .spawn(move || self.run(notifier, shutdown_rx))?;

        Ok(RedisExpiryListenerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    fn run(self, notifier: ExpiryNotifier, shutdown_rx: mpsc::Receiver<()>) {
        let mut reconnect = Reconnect::new(self.poll, self.max_backoff);
        loop {
            if shutdown_rx.try_recv().is_ok() {
                return;
            }
            match self.listen(&notifier, &shutdown_rx, &mut reconnect) {
                Ok(()) => return,
                Err(e) => {
                    let delay = reconnect.failed();
                    warn!(
                        error = %e,
                        attempt = reconnect.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "expiry listener disconnected"
                    );
                    if shutdown_rx.recv_timeout(delay).is_ok() {
                        return;
                    }
                }
            }
        }
    }

    /// Returns `Ok` on shutdown, `Err` when the connection must be rebuilt.
    fn listen(
        &self,
        notifier: &ExpiryNotifier,
        shutdown_rx: &mpsc::Receiver<()>,
        reconnect: &mut Reconnect,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_connection()?;
        if self.configure_server {
            let set: redis::RedisResult<()> = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Ex")
                .query(&mut conn);
            if let Err(e) = set {
                warn!(error = %e, "could not enable keyspace notifications");
            }
        }

        let mut pubsub = conn.as_pubsub();
        pubsub.set_read_timeout(Some(self.poll))?;
        pubsub.psubscribe(EXPIRED_EVENTS)?;
        reconnect.connected();
        info!(pattern = EXPIRED_EVENTS, "expiry listener subscribed");

        loop {
            if shutdown_rx.try_recv().is_ok() {
                return Ok(());
            }
            let msg = match pubsub.get_message() {
                Ok(m) => m,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            };
            let key: String = match msg.get_payload() {
                Ok(k) => k,
                Err(_) => continue,
            };
            if let Some(order_id) = self.order_id_from_key(&key) {
                debug!(order_id = %order_id, "hold window elapsed");
                notifier.notify(order_id);
            }
        }
    }
}

/// Consecutive failed connection attempts; reset once a subscription is up.
#[derive(Debug)]
struct Reconnect {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Reconnect {
    fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Record a failure and return the delay before the next attempt.
    fn failed(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        backoff(self.base, self.max, self.attempt)
    }

    fn connected(&mut self) {
        self.attempt = 0;
    }
}

fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let pow = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(pow).min(max)
}
