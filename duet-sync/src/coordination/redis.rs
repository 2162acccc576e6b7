//! Redis-backed coordination store.
//!
//! Commands go through a deadpool connection pool; every mutation of a log is
//! a single Lua script so concurrent pushes from different processes cannot
//! race on clock assignment. Pub/sub runs on a dedicated connection owned by a
//! subscriber task that reconnects with exponential backoff.
//!
//! Keys per document (`<prefix>` from [`CoordinationConfig`]):
//! - `<prefix>:doc:<id>:log`: list of raw updates
//! - `<prefix>:doc:<id>:offset`: entries folded into the durable snapshot
//! - `<prefix>:doc:<id>:bytes`: byte size of the list
//! - channel `<prefix>:doc:<id>`: published clocks

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use futures_util::StreamExt;
use redis::Script;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use super::{
    parse_clock, CoordinationError, CoordinationResult, CoordinationStore, LogPush, LogRange,
    Notification,
};
use crate::config::CoordinationConfig;

const PUSH_SCRIPT: &str = r#"
local length = redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('INCRBY', KEYS[3], string.len(ARGV[1]))
local offset = tonumber(redis.call('GET', KEYS[2]) or '0')
return {length, offset}
"#;

const PULL_SCRIPT: &str = r#"
local offset = tonumber(redis.call('GET', KEYS[2]) or '0')
local length = redis.call('LLEN', KEYS[1])
local start = tonumber(ARGV[1]) - offset
if start < 0 then start = 0 end
if start > length then start = length end
local entries = redis.call('LRANGE', KEYS[1], start, -1)
return {offset, start, entries}
"#;

const TRIM_SCRIPT: &str = r#"
local offset = tonumber(redis.call('GET', KEYS[2]) or '0')
if offset ~= tonumber(ARGV[1]) then return -1 end
local count = tonumber(ARGV[2])
if count <= 0 then return offset end
local drained = redis.call('LRANGE', KEYS[1], 0, count - 1)
local bytes = 0
for _, entry in ipairs(drained) do bytes = bytes + string.len(entry) end
redis.call('LTRIM', KEYS[1], #drained, -1)
redis.call('DECRBY', KEYS[3], bytes)
return redis.call('INCRBY', KEYS[2], #drained)
"#;

const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

enum SubscriberCommand {
    Subscribe(String, oneshot::Sender<CoordinationResult<()>>),
    Unsubscribe(String, oneshot::Sender<CoordinationResult<()>>),
}

/// Redis coordination store.
pub struct RedisStore {
    pool: Pool,
    key_prefix: String,
    push_script: Script,
    pull_script: Script,
    trim_script: Script,
    commands: mpsc::Sender<SubscriberCommand>,
    notifications: broadcast::Sender<Notification>,
}

impl RedisStore {
    /// Connect the command pool and start the subscriber task.
    ///
    /// Must be called from inside a tokio runtime.
    pub async fn connect(config: &CoordinationConfig) -> CoordinationResult<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))?;
        drop(conn);

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))?;
        let (commands, command_rx) = mpsc::channel(256);
        let (notifications, _) = broadcast::channel(config.notification_capacity);

        let prefix = format!("{}:doc:", config.key_prefix);
        tokio::spawn(run_subscriber(
            client,
            prefix,
            command_rx,
            notifications.clone(),
        ));

        log::info!("Connected to coordination store at {}", config.url);

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            push_script: Script::new(PUSH_SCRIPT),
            pull_script: Script::new(PULL_SCRIPT),
            trim_script: Script::new(TRIM_SCRIPT),
            commands,
            notifications,
        })
    }

    fn channel(&self, doc_id: Uuid) -> String {
        format!("{}:doc:{doc_id}", self.key_prefix)
    }

    fn log_key(&self, doc_id: Uuid) -> String {
        format!("{}:doc:{doc_id}:log", self.key_prefix)
    }

    fn offset_key(&self, doc_id: Uuid) -> String {
        format!("{}:doc:{doc_id}:offset", self.key_prefix)
    }

    fn bytes_key(&self, doc_id: Uuid) -> String {
        format!("{}:doc:{doc_id}:bytes", self.key_prefix)
    }

    async fn conn(&self) -> CoordinationResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))
    }

    async fn send_command(
        &self,
        build: impl FnOnce(oneshot::Sender<CoordinationResult<()>>) -> SubscriberCommand,
    ) -> CoordinationResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CoordinationError::ConnectionFailed("subscriber task stopped".into()))?;
        rx.await
            .map_err(|_| CoordinationError::ConnectionFailed("subscriber task stopped".into()))?
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn push(&self, doc_id: Uuid, update: &[u8]) -> CoordinationResult<LogPush> {
        let mut conn = self.conn().await?;
        let (length, offset): (u64, u64) = self
            .push_script
            .key(self.log_key(doc_id))
            .key(self.offset_key(doc_id))
            .key(self.bytes_key(doc_id))
            .arg(update)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| CoordinationError::CommandFailed(e.to_string()))?;
        Ok(LogPush { length, offset })
    }

    async fn pull(&self, doc_id: Uuid, since: u64) -> CoordinationResult<LogRange> {
        let mut conn = self.conn().await?;
        let (offset, start, updates): (u64, u64, Vec<Vec<u8>>) = self
            .pull_script
            .key(self.log_key(doc_id))
            .key(self.offset_key(doc_id))
            .arg(since)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| CoordinationError::CommandFailed(e.to_string()))?;
        Ok(LogRange { offset, start, updates })
    }

    async fn byte_len(&self, doc_id: Uuid) -> CoordinationResult<u64> {
        let mut conn = self.conn().await?;
        let bytes: Option<i64> = redis::cmd("GET")
            .arg(self.bytes_key(doc_id))
            .query_async(&mut *conn)
            .await
            .map_err(|e| CoordinationError::CommandFailed(e.to_string()))?;
        Ok(bytes.unwrap_or(0).max(0) as u64)
    }

    async fn trim(
        &self,
        doc_id: Uuid,
        expected_offset: u64,
        count: u64,
    ) -> CoordinationResult<Option<u64>> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .trim_script
            .key(self.log_key(doc_id))
            .key(self.offset_key(doc_id))
            .key(self.bytes_key(doc_id))
            .arg(expected_offset)
            .arg(count)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| CoordinationError::CommandFailed(e.to_string()))?;
        Ok((result >= 0).then_some(result as u64))
    }

    async fn remove(&self, doc_id: Uuid) -> CoordinationResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(self.log_key(doc_id))
            .arg(self.offset_key(doc_id))
            .arg(self.bytes_key(doc_id))
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|e| CoordinationError::CommandFailed(e.to_string()))?;
        Ok(())
    }

    async fn publish(&self, doc_id: Uuid, clock: u64) -> CoordinationResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PUBLISH")
            .arg(self.channel(doc_id))
            .arg(clock.to_string())
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|e| CoordinationError::CommandFailed(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, doc_id: Uuid) -> CoordinationResult<()> {
        let channel = self.channel(doc_id);
        self.send_command(|tx| SubscriberCommand::Subscribe(channel, tx)).await
    }

    async fn unsubscribe(&self, doc_id: Uuid) -> CoordinationResult<()> {
        let channel = self.channel(doc_id);
        self.send_command(|tx| SubscriberCommand::Unsubscribe(channel, tx)).await
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}

enum SubscriberEvent {
    Command(Option<SubscriberCommand>),
    Message(Option<redis::Msg>),
}

/// Own the pub/sub connection: apply (un)subscribe commands, forward messages,
/// and reconnect with backoff when the connection drops.
async fn run_subscriber(
    client: redis::Client,
    prefix: String,
    mut commands: mpsc::Receiver<SubscriberCommand>,
    notifications: broadcast::Sender<Notification>,
) {
    let mut channels: HashSet<String> = HashSet::new();
    let mut backoff = MIN_BACKOFF;
    let mut reconnecting = false;

    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                log::error!("Coordination pub/sub connect failed: {e}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                reconnecting = true;
                continue;
            }
        };

        let mut resubscribed = true;
        for channel in &channels {
            if let Err(e) = pubsub.subscribe(channel).await {
                log::error!("Re-subscribe to {channel} failed: {e}");
                resubscribed = false;
                break;
            }
        }
        if !resubscribed {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            continue;
        }

        backoff = MIN_BACKOFF;
        if reconnecting {
            log::info!("Coordination pub/sub reconnected ({} channels)", channels.len());
            let _ = notifications.send(Notification::Resync);
            reconnecting = false;
        }

        loop {
            let event = {
                let mut messages = Box::pin(pubsub.on_message());
                tokio::select! {
                    command = commands.recv() => SubscriberEvent::Command(command),
                    message = messages.next() => SubscriberEvent::Message(message),
                }
            };

            match event {
                SubscriberEvent::Command(None) => {
                    log::debug!("Coordination subscriber shutting down");
                    return;
                }
                SubscriberEvent::Command(Some(SubscriberCommand::Subscribe(channel, reply))) => {
                    let result = pubsub
                        .subscribe(&channel)
                        .await
                        .map_err(|e| CoordinationError::CommandFailed(e.to_string()));
                    if result.is_ok() {
                        channels.insert(channel);
                    }
                    let _ = reply.send(result);
                }
                SubscriberEvent::Command(Some(SubscriberCommand::Unsubscribe(channel, reply))) => {
                    channels.remove(&channel);
                    let result = pubsub
                        .unsubscribe(&channel)
                        .await
                        .map_err(|e| CoordinationError::CommandFailed(e.to_string()));
                    let _ = reply.send(result);
                }
                SubscriberEvent::Message(Some(msg)) => {
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            log::warn!("Unreadable payload on {channel}: {e}");
                            continue;
                        }
                    };
                    match decode_signal(&prefix, &channel, &payload) {
                        Some(notification) => {
                            let _ = notifications.send(notification);
                        }
                        None => log::warn!("Ignoring malformed signal on {channel}: {payload:?}"),
                    }
                }
                SubscriberEvent::Message(None) => {
                    log::warn!("Coordination pub/sub connection lost");
                    reconnecting = true;
                    break;
                }
            }
        }
    }
}

fn decode_signal(prefix: &str, channel: &str, payload: &str) -> Option<Notification> {
    let doc_id = Uuid::parse_str(channel.strip_prefix(prefix)?).ok()?;
    let clock = parse_clock(payload)?;
    Some(Notification::Clock { doc_id, clock })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_signal() {
        let doc = Uuid::new_v4();
        let channel = format!("duet:doc:{doc}");
        assert_eq!(
            decode_signal("duet:doc:", &channel, "12"),
            Some(Notification::Clock { doc_id: doc, clock: 12 })
        );
    }

    #[test]
    fn test_decode_signal_rejects_foreign_channels() {
        assert_eq!(decode_signal("duet:doc:", "other:doc:x", "1"), None);
        let channel = format!("duet:doc:{}", Uuid::new_v4());
        assert_eq!(decode_signal("duet:doc:", &channel, "not-a-clock"), None);
    }
}
