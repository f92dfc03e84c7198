//! Redis-backed presence store, shared by every service instance.
//!
//! Key layout (`{p}` is the configured prefix):
//!
//! | Key | Type | Contents |
//! |---|---|---|
//! | `{p}:conns:{account}` | hash | connection ID -> heartbeat expiry |
//! | `{p}:acct:{account}` | hash | `seen`, `expiry`, `offline` |
//! | `{p}:conn:{connection}` | string | owning account, expires on its own |
//! | `{p}:due` | sorted set | account scored by latest expiry |
//! | `{p}:lock:{key}` | string | lock holder, `SET NX EX` |
//! | `{p}:window:{key}` | hash | `start`, `count` |
//!
//! Compound operations run as Lua scripts so each is atomic on the server.
//! A heartbeat write also drops the account's expired rows; their `conn:`
//! index entries are left to expire on their own.

use super::{AccountRecord, FinalizeOutcome, HeartbeatWrite, PresenceStore, WindowCount};
use crate::error::PresenceError;
use crate::model::{AccountId, ConnectionHeartbeat};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::info;

/// Shared helper prepended to scripts that need an account's latest expiry.
/// KEYS: conns hash, account hash.
const LATEST_EXPIRY_FN: &str = r"
local function latest_expiry(conns, acct)
  local best = tonumber(redis.call('HGET', acct, 'expiry') or '-1')
  for _, v in ipairs(redis.call('HVALS', conns)) do
    local n = tonumber(v)
    if n > best then best = n end
  end
  return best
end
";

/// KEYS: conns, acct, conn index, due.
/// ARGV: connection, expires_at, seen_at, account, index ttl.
const PUT_HEARTBEAT: &str = r"
local prev = redis.call('HGET', KEYS[1], ARGV[1])
local existed = 0
if prev and tonumber(prev) > tonumber(ARGV[3]) then existed = 1 end
local seen = redis.call('HGET', KEYS[2], 'seen')
local revived = 0
if (not seen) or redis.call('HEXISTS', KEYS[2], 'offline') == 1 then revived = 1 end
local rows = redis.call('HGETALL', KEYS[1])
for i = 1, #rows, 2 do
  local n = tonumber(rows[i + 1])
  if rows[i] ~= ARGV[1] and n <= tonumber(ARGV[3]) then
    redis.call('HDEL', KEYS[1], rows[i])
    local prev = tonumber(redis.call('HGET', KEYS[2], 'expiry') or '-1')
    if n > prev then redis.call('HSET', KEYS[2], 'expiry', n) end
  end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
if (not seen) or tonumber(seen) < tonumber(ARGV[3]) then
  redis.call('HSET', KEYS[2], 'seen', ARGV[3])
end
redis.call('HDEL', KEYS[2], 'offline')
redis.call('SET', KEYS[3], ARGV[4], 'EX', ARGV[5])
redis.call('ZADD', KEYS[4], latest_expiry(KEYS[1], KEYS[2]), ARGV[4])
return {existed, revived}
";

/// KEYS: conns, acct, conn index, due.
/// ARGV: connection, ended_at, account.
const REMOVE_HEARTBEAT: &str = r"
local expires = redis.call('HGET', KEYS[1], ARGV[1])
if not expires then return 0 end
redis.call('HDEL', KEYS[1], ARGV[1])
local ended = math.min(tonumber(expires), tonumber(ARGV[2]))
local prev = tonumber(redis.call('HGET', KEYS[2], 'expiry') or '-1')
if ended > prev then redis.call('HSET', KEYS[2], 'expiry', ended) end
if redis.call('GET', KEYS[3]) == ARGV[3] then redis.call('DEL', KEYS[3]) end
if redis.call('HEXISTS', KEYS[2], 'offline') == 0 then
  redis.call('ZADD', KEYS[4], latest_expiry(KEYS[1], KEYS[2]), ARGV[3])
end
return 1
";

/// KEYS: conns, acct, due.
/// ARGV: account.
const RESCHEDULE: &str = r"
if redis.call('HEXISTS', KEYS[2], 'offline') == 1 then
  redis.call('ZREM', KEYS[3], ARGV[1])
  return 0
end
local best = latest_expiry(KEYS[1], KEYS[2])
if best < 0 then
  redis.call('ZREM', KEYS[3], ARGV[1])
  return 0
end
redis.call('ZADD', KEYS[3], best, ARGV[1])
return 1
";

/// KEYS: conns, acct, due.
/// ARGV: account, now, cutoff.
/// Returns {code, last_seen}: 0 finalized, 1 not due, 2 already offline.
const FINALIZE_OFFLINE: &str = r"
if redis.call('HEXISTS', KEYS[2], 'offline') == 1 then
  redis.call('ZREM', KEYS[3], ARGV[1])
  return {2, -1}
end
local now = tonumber(ARGV[2])
local best = tonumber(redis.call('HGET', KEYS[2], 'expiry') or '-1')
local live = false
for _, v in ipairs(redis.call('HVALS', KEYS[1])) do
  local n = tonumber(v)
  if n > now then live = true end
  if n > best then best = n end
end
if best < 0 then
  redis.call('ZREM', KEYS[3], ARGV[1])
  return {2, -1}
end
if live or best > tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[3], best, ARGV[1])
  return {1, -1}
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[2], 'offline', ARGV[2])
redis.call('HSET', KEYS[2], 'expiry', best)
redis.call('ZREM', KEYS[3], ARGV[1])
return {0, tonumber(redis.call('HGET', KEYS[2], 'seen') or '-1')}
";

/// KEYS: lock. ARGV: holder.
const RELEASE_LOCK: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// KEYS: window. ARGV: now, window seconds.
const INCREMENT_WINDOW: &str = r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local start = tonumber(redis.call('HGET', KEYS[1], 'start') or '-1')
if start < 0 or now >= start + window then
  redis.call('HSET', KEYS[1], 'start', now)
  redis.call('HSET', KEYS[1], 'count', 0)
  start = now
end
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
redis.call('EXPIRE', KEYS[1], window * 2)
return {count, start}
";

/// [`PresenceStore`] over a Redis server.
pub struct RedisStore {
    connection: MultiplexedConnection,
    prefix: String,
    /// Lifetime of the connection -> account index entries.
    index_ttl_seconds: u64,
    put_heartbeat: Script,
    remove_heartbeat: Script,
    reschedule: Script,
    finalize_offline: Script,
    release_lock: Script,
    increment_window: Script,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// `index_ttl_seconds` bounds how long a connection can still be resolved
    /// to its account after its last heartbeat; heartbeat TTL plus grace is a
    /// sensible value.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        index_ttl_seconds: u64,
    ) -> Result<Self, PresenceError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        let prefix = prefix.into();

        info!(prefix = %prefix, "Connected to redis presence store");

        Ok(Self {
            connection,
            prefix,
            index_ttl_seconds: index_ttl_seconds.max(1),
            put_heartbeat: Script::new(&format!("{LATEST_EXPIRY_FN}{PUT_HEARTBEAT}")),
            remove_heartbeat: Script::new(&format!("{LATEST_EXPIRY_FN}{REMOVE_HEARTBEAT}")),
            reschedule: Script::new(&format!("{LATEST_EXPIRY_FN}{RESCHEDULE}")),
            finalize_offline: Script::new(FINALIZE_OFFLINE),
            release_lock: Script::new(RELEASE_LOCK),
            increment_window: Script::new(INCREMENT_WINDOW),
        })
    }

    fn conns_key(&self, account_id: &str) -> String {
        format!("{}:conns:{}", self.prefix, account_id)
    }

    fn account_key(&self, account_id: &str) -> String {
        format!("{}:acct:{}", self.prefix, account_id)
    }

    fn connection_key(&self, connection_id: &str) -> String {
        format!("{}:conn:{}", self.prefix, connection_id)
    }

    fn due_key(&self) -> String {
        format!("{}:due", self.prefix)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}:window:{}", self.prefix, key)
    }
}

fn non_negative(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn put_heartbeat(
        &self,
        heartbeat: &ConnectionHeartbeat,
        seen_at: u64,
    ) -> Result<HeartbeatWrite, PresenceError> {
        let mut connection = self.connection.clone();
        let (existed, revived): (i64, i64) = self
            .put_heartbeat
            .key(self.conns_key(&heartbeat.account_id))
            .key(self.account_key(&heartbeat.account_id))
            .key(self.connection_key(&heartbeat.connection_id))
            .key(self.due_key())
            .arg(&heartbeat.connection_id)
            .arg(heartbeat.expires_at)
            .arg(seen_at)
            .arg(&heartbeat.account_id)
            .arg(self.index_ttl_seconds)
            .invoke_async(&mut connection)
            .await?;

        Ok(HeartbeatWrite {
            existed: existed == 1,
            revived: revived == 1,
        })
    }

    async fn remove_heartbeat(
        &self,
        account_id: &str,
        connection_id: &str,
        ended_at: u64,
    ) -> Result<bool, PresenceError> {
        let mut connection = self.connection.clone();
        let removed: i64 = self
            .remove_heartbeat
            .key(self.conns_key(account_id))
            .key(self.account_key(account_id))
            .key(self.connection_key(connection_id))
            .key(self.due_key())
            .arg(connection_id)
            .arg(ended_at)
            .arg(account_id)
            .invoke_async(&mut connection)
            .await?;

        Ok(removed == 1)
    }

    async fn account_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<AccountId>, PresenceError> {
        let mut connection = self.connection.clone();
        let account: Option<String> = connection.get(self.connection_key(connection_id)).await?;
        Ok(account)
    }

    async fn load_account(&self, account_id: &str) -> Result<Option<AccountRecord>, PresenceError> {
        let mut connection = self.connection.clone();
        let (conns, meta): (HashMap<String, u64>, HashMap<String, u64>) = redis::pipe()
            .atomic()
            .cmd("HGETALL")
            .arg(self.conns_key(account_id))
            .cmd("HGETALL")
            .arg(self.account_key(account_id))
            .query_async(&mut connection)
            .await?;

        if conns.is_empty() && meta.is_empty() {
            return Ok(None);
        }

        Ok(Some(AccountRecord {
            heartbeats: conns.into_iter().collect(),
            last_seen_at: meta.get("seen").copied(),
            last_expiry_at: meta.get("expiry").copied(),
            offline_at: meta.get("offline").copied(),
        }))
    }

    async fn due_for_offline(
        &self,
        cutoff: u64,
        limit: usize,
    ) -> Result<Vec<AccountId>, PresenceError> {
        let mut connection = self.connection.clone();
        let accounts: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.due_key())
            .arg("-inf")
            .arg(cutoff)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut connection)
            .await?;

        Ok(accounts)
    }

    async fn reschedule_offline(&self, account_id: &str) -> Result<(), PresenceError> {
        let mut connection = self.connection.clone();
        let _: i64 = self
            .reschedule
            .key(self.conns_key(account_id))
            .key(self.account_key(account_id))
            .key(self.due_key())
            .arg(account_id)
            .invoke_async(&mut connection)
            .await?;

        Ok(())
    }

    async fn finalize_offline(
        &self,
        account_id: &str,
        now: u64,
        cutoff: u64,
    ) -> Result<FinalizeOutcome, PresenceError> {
        let mut connection = self.connection.clone();
        let (code, last_seen): (i64, i64) = self
            .finalize_offline
            .key(self.conns_key(account_id))
            .key(self.account_key(account_id))
            .key(self.due_key())
            .arg(account_id)
            .arg(now)
            .arg(cutoff)
            .invoke_async(&mut connection)
            .await?;

        match code {
            0 => Ok(FinalizeOutcome::Finalized {
                last_online_at: non_negative(last_seen),
            }),
            1 => Ok(FinalizeOutcome::NotDue),
            2 => Ok(FinalizeOutcome::AlreadyOffline),
            other => Err(PresenceError::StorageUnavailable(format!(
                "unexpected finalize result {other}"
            ))),
        }
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        _now: u64,
        ttl_seconds: u64,
    ) -> Result<bool, PresenceError> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut connection)
            .await?;

        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, PresenceError> {
        let mut connection = self.connection.clone();
        let deleted: i64 = self
            .release_lock
            .key(self.lock_key(key))
            .arg(holder)
            .invoke_async(&mut connection)
            .await?;

        Ok(deleted == 1)
    }

    async fn increment_window(
        &self,
        key: &str,
        now: u64,
        window_seconds: u64,
    ) -> Result<WindowCount, PresenceError> {
        let mut connection = self.connection.clone();
        let (count, window_start): (u64, u64) = self
            .increment_window
            .key(self.window_key(key))
            .arg(now)
            .arg(window_seconds)
            .invoke_async(&mut connection)
            .await?;

        Ok(WindowCount {
            count,
            window_start,
        })
    }
}
