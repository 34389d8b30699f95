//! Redis-backed storage adapter.
//!
//! Shares tracking state across processes. Every compound mutation runs as a
//! server-side Lua script, so no two clients can race on one identity: the
//! freshness check, key-limit enforcement, strategy decision, record write,
//! TTL, deferred-index and size-counter maintenance all happen inside one
//! atomic script execution.
//!
//! ## Layout
//!
//! - Record hash at `<prefix><composite-key>` with JSON-encoded `details`,
//!   `config` and `strategyData` fields, TTL set to `ceil(expires_at / 1000)`
//!   seconds.
//! - Deferred index: sorted set `<prefix>deferred-set`, member = composite
//!   key, score = scheduled release time in epoch ms.
//! - Size counter: integer at `<prefix>size`, maintained by the scripts.
//!
//! The strategy decision is replayed inside the track script (one arm per
//! strategy type tag), mirroring the client-side implementations in
//! `domain::strategy`. The two must be kept in lockstep when a strategy is
//! added or changed.
//!
//! ## Error handling
//!
//! Backend failures are wrapped with the operation name. Corrupted record
//! hashes (unparseable fields) are logged at `warn` and treated as absent
//! rather than fatal.
//!
//! The adapter does not own the underlying client connection; `destroy` is a
//! no-op on it.

use crate::application::ports::{Clock, StorageAdapter, StorageError, TrackResult};
use crate::domain::record::{EventRecord, NewEvent, RecordConfig};
use crate::domain::strategy::{
    IgnoreReason, Outcome, Strategy, StrategyKind, ThrottleStrategy,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Pipeline, RedisError, Script};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::infrastructure::clock::SystemClock;

/// Attempts for the optimistic `update` transaction before giving up.
const UPDATE_RETRY_ATTEMPTS: u32 = 3;

/// Atomic track: load, freshness check, key-limit check, strategy decision,
/// write, TTL, index and size maintenance. Returns either
/// `{'ignored', 'key_limit_reached'}` or the full outcome tuple.
const TRACK_SCRIPT: &str = r#"
local record_key = KEYS[1]
local deferred_key = KEYS[2]
local size_key = KEYS[3]

local composite = ARGV[1]
local details_hash = ARGV[5]
local now = tonumber(ARGV[6])
local max_keys = tonumber(ARGV[7])
local kind = ARGV[8]
local p1 = tonumber(ARGV[9])
local p2 = tonumber(ARGV[10])
local p3 = tonumber(ARGV[11])
local cfg = cjson.decode(ARGV[12])
local expire_time = tonumber(ARGV[13])
local defer_interval = tonumber(ARGV[14])

local raw = redis.call('HGETALL', record_key)
local prior = nil
if #raw > 0 then
  prior = {}
  for i = 1, #raw, 2 do
    prior[raw[i]] = raw[i + 1]
  end
end

local exists = prior ~= nil
local fresh = true
local data = nil
if prior then
  local expires = tonumber(prior['expiresAt'])
  if expires and now <= expires and prior['detailsHash'] == details_hash then
    fresh = false
    local ok, decoded = pcall(cjson.decode, prior['config'])
    if ok and type(decoded) == 'table' then
      cfg = decoded
    end
    local okd, decoded_data = pcall(cjson.decode, prior['strategyData'])
    if okd and type(decoded_data) == 'table' then
      data = decoded_data
    end
  end
end

if fresh and not exists and max_keys > 0 then
  local size = tonumber(redis.call('GET', size_key) or '0')
  if size >= max_keys then
    return {'ignored', 'key_limit_reached'}
  end
end

expire_time = tonumber(cfg.expire_time) or expire_time
defer_interval = tonumber(cfg.defer_interval) or defer_interval

local outcome = 'immediate'
local reason = ''
local count, last, deferred, sched

if fresh then
  count = 1
  last = now
  deferred = false
  sched = nil
  if kind == 'simple' then
    local limit = tonumber(cfg.limit) or p1
    data = {type = 'none'}
    if count > limit then
      deferred = true
      sched = now + defer_interval
      outcome = 'deferred'
    end
  elseif kind == 'token-bucket' then
    local bucket = tonumber(cfg.bucket_size) or p1
    data = {type = 'token-bucket', tokens = bucket - 1, last_refill = now}
  else
    data = {type = 'sliding-window', current_count = 1, previous_count = 0, window_start = now}
  end
else
  count = tonumber(prior['count']) or 1
  last = tonumber(prior['lastEventTime']) or now
  sched = tonumber(prior['scheduledSendAt'])
  local was_deferred = prior['deferred'] == 'true'
  deferred = was_deferred

  if kind == 'simple' then
    local limit = tonumber(cfg.limit) or p1
    data = {type = 'none'}
    if was_deferred then
      outcome = 'ignored'
      reason = 'already_deferred'
    else
      count = count + 1
      last = now
      if count > limit then
        deferred = true
        sched = now + defer_interval
        outcome = 'deferred'
      end
    end
  elseif kind == 'token-bucket' then
    local bucket = tonumber(cfg.bucket_size) or p1
    local rate = tonumber(cfg.refill_rate) or p2
    local tokens = bucket
    local last_refill = now
    if data and data.type == 'token-bucket' then
      tokens = tonumber(data.tokens) or bucket
      last_refill = tonumber(data.last_refill) or now
    end
    local elapsed = now - last_refill
    if elapsed < 0 then elapsed = 0 end
    tokens = tokens + elapsed / 1000 * rate
    if tokens > bucket then tokens = bucket end
    last = now
    if tokens >= 1 then
      tokens = tokens - 1
      count = count + 1
      deferred = false
      sched = nil
    else
      deferred = true
      local retry = math.ceil((1 - tokens) * (1000 / rate))
      if retry < 1 then retry = 1 end
      sched = now + retry
      outcome = 'deferred'
    end
    data = {type = 'token-bucket', tokens = tokens, last_refill = now}
  else
    local limit = tonumber(cfg.limit) or p1
    local window = tonumber(cfg.window_size) or p2
    if not window or window < 1 then window = 1 end
    local current = 0
    local previous = 0
    local start = now
    if data and data.type == 'sliding-window' then
      current = tonumber(data.current_count) or 0
      previous = tonumber(data.previous_count) or 0
      start = tonumber(data.window_start) or now
    end
    local elapsed = now - start
    if elapsed < 0 then elapsed = 0 end
    if elapsed >= window then
      if elapsed >= 2 * window then previous = 0 else previous = current end
      current = 0
      start = now - (elapsed % window)
    end
    local weight = (window - (now - start)) / window
    local estimated = current + previous * weight
    if estimated < limit then
      current = current + 1
      count = math.floor(estimated + 1)
      last = now
      deferred = false
      sched = nil
    elseif was_deferred then
      outcome = 'ignored'
      reason = 'already_deferred'
    else
      deferred = true
      sched = now + defer_interval
      last = now
      outcome = 'deferred'
    end
    data = {type = 'sliding-window', current_count = current, previous_count = previous, window_start = start}
  end
end

local expires = now + expire_time

if not exists then
  redis.call('INCR', size_key)
end

redis.call('DEL', record_key)
redis.call('HSET', record_key,
  'key', composite,
  'category', ARGV[2],
  'id', ARGV[3],
  'details', ARGV[4],
  'detailsHash', details_hash,
  'count', count,
  'lastEventTime', last,
  'expiresAt', expires,
  'deferred', deferred and 'true' or 'false',
  'strategyData', cjson.encode(data),
  'config', cjson.encode(cfg))
if sched then
  redis.call('HSET', record_key, 'scheduledSendAt', sched)
end
redis.call('EXPIREAT', record_key, math.ceil(expires / 1000))

if deferred and sched then
  redis.call('ZADD', deferred_key, sched, composite)
else
  redis.call('ZREM', deferred_key, composite)
end

local sched_str = ''
if sched then sched_str = tostring(sched) end
return {outcome, reason, tostring(count), tostring(last), tostring(expires),
        deferred and 'true' or 'false', sched_str,
        cjson.encode(cfg), cjson.encode(data)}
"#;

/// Atomic pop of all due deferred records: range-read the index, delete each
/// record hash, decrement the size counter, return `[member, field pairs...]`
/// per record.
const POP_DUE_SCRIPT: &str = r#"
local deferred_key = KEYS[1]
local size_key = KEYS[2]
local now = ARGV[1]
local prefix = ARGV[2]

local due = redis.call('ZRANGEBYSCORE', deferred_key, '-inf', now)
local result = {}
for i = 1, #due do
  local member = due[i]
  local record_key = prefix .. member
  local raw = redis.call('HGETALL', record_key)
  if #raw > 0 then
    redis.call('DEL', record_key)
    if tonumber(redis.call('DECR', size_key)) < 0 then
      redis.call('SET', size_key, '0')
    end
    local entry = {member}
    for j = 1, #raw do
      entry[#entry + 1] = raw[j]
    end
    result[#result + 1] = entry
  end
  redis.call('ZREM', deferred_key, member)
end
return result
"#;

/// Read-only slot check: 1 if the record exists or the live size is below
/// the limit.
const ACQUIRE_SLOT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 1
end
local max_keys = tonumber(ARGV[1])
if max_keys <= 0 then
  return 1
end
local size = tonumber(redis.call('GET', KEYS[2]) or '0')
if size < max_keys then
  return 1
end
return 0
"#;

/// Configuration for the Redis adapter.
#[derive(Debug, Clone)]
pub struct RedisAdapterConfig {
    /// Prefix for all keys written by the adapter (default: "event-tracker:")
    pub key_prefix: String,
}

impl Default for RedisAdapterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "event-tracker:".to_string(),
        }
    }
}

/// Redis-backed storage adapter for distributed tracking.
///
/// Multiple application instances pointing at the same Redis see one shared
/// set of identities, with all mutations serialized server-side.
pub struct RedisAdapter {
    connection: Arc<RwLock<ConnectionManager>>,
    config: RedisAdapterConfig,
    clock: Arc<dyn Clock>,
    deferred_key: String,
    size_key: String,
    track_script: Script,
    pop_script: Script,
    acquire_script: Script,
}

impl fmt::Debug for RedisAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisAdapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisAdapter {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisAdapterConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if the connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisAdapterConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(connection, config))
    }

    /// Build an adapter over a host-owned connection.
    ///
    /// The adapter never closes this connection; the host application owns
    /// its lifecycle.
    pub fn with_connection(connection: ConnectionManager, config: RedisAdapterConfig) -> Self {
        let deferred_key = format!("{}deferred-set", config.key_prefix);
        let size_key = format!("{}size", config.key_prefix);
        Self {
            connection: Arc::new(RwLock::new(connection)),
            config,
            clock: Arc::new(SystemClock::new()),
            deferred_key,
            size_key,
            track_script: Script::new(TRACK_SCRIPT),
            pop_script: Script::new(POP_DUE_SCRIPT),
            acquire_script: Script::new(ACQUIRE_SLOT_SCRIPT),
        }
    }

    /// Replace the clock (used by tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Field pairs for one record hash, wire names per the storage layout.
    fn record_fields(record: &EventRecord) -> Result<Vec<(&'static str, String)>, StorageError> {
        let details = serde_json::to_string(&record.details)
            .map_err(|e| StorageError::backend("serialize", e))?;
        let config = serde_json::to_string(&record.config)
            .map_err(|e| StorageError::backend("serialize", e))?;
        let strategy_data = serde_json::to_string(&record.strategy_data)
            .map_err(|e| StorageError::backend("serialize", e))?;

        let mut fields = vec![
            ("key", record.key.clone()),
            ("category", record.category.clone()),
            ("id", record.id.clone()),
            ("details", details),
            ("detailsHash", record.details_hash.clone()),
            ("count", record.count.to_string()),
            ("lastEventTime", record.last_event_time.to_string()),
            ("expiresAt", record.expires_at.to_string()),
            ("deferred", if record.deferred { "true" } else { "false" }.to_string()),
            ("strategyData", strategy_data),
            ("config", config),
        ];
        if let Some(scheduled) = record.scheduled_send_at {
            fields.push(("scheduledSendAt", scheduled.to_string()));
        }
        Ok(fields)
    }

    /// Parse one record hash; `None` when the hash is corrupted.
    fn parse_record(map: &HashMap<String, String>) -> Option<EventRecord> {
        let details = map
            .get("details")
            .map(|d| serde_json::from_str(d).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        Some(EventRecord {
            key: map.get("key")?.clone(),
            category: map.get("category")?.clone(),
            id: map.get("id")?.clone(),
            details,
            details_hash: map.get("detailsHash").cloned().unwrap_or_default(),
            count: map.get("count")?.parse().ok()?,
            last_event_time: map.get("lastEventTime")?.parse().ok()?,
            expires_at: map.get("expiresAt")?.parse().ok()?,
            deferred: map.get("deferred").map(|d| d == "true").unwrap_or(false),
            scheduled_send_at: map.get("scheduledSendAt").and_then(|s| s.parse().ok()),
            config: serde_json::from_str(map.get("config")?).ok()?,
            strategy_data: map
                .get("strategyData")
                .and_then(|d| serde_json::from_str(d).ok())
                .unwrap_or_default(),
        })
    }

    /// Parse a `[member, field, value, ...]` script entry.
    fn parse_script_entry(entry: &[String]) -> Option<EventRecord> {
        let (_member, fields) = entry.split_first()?;
        let mut map = HashMap::with_capacity(fields.len() / 2);
        for pair in fields.chunks_exact(2) {
            map.insert(pair[0].clone(), pair[1].clone());
        }
        Self::parse_record(&map)
    }

    /// Queue the full record write (clear, hash fields, TTL, index) onto an
    /// atomic pipeline.
    fn queue_record_write(
        &self,
        pipe: &mut Pipeline,
        record_key: &str,
        member: &str,
        record: &EventRecord,
    ) -> Result<(), StorageError> {
        let fields = Self::record_fields(record)?;
        pipe.del(record_key).ignore();
        pipe.hset_multiple(record_key, &fields).ignore();
        pipe.cmd("EXPIREAT")
            .arg(record_key)
            .arg(record.expires_at.div_ceil(1000))
            .ignore();
        match (record.deferred, record.scheduled_send_at) {
            (true, Some(scheduled)) => {
                pipe.zadd(&self.deferred_key, member, scheduled).ignore();
            }
            _ => {
                pipe.zrem(&self.deferred_key, member).ignore();
            }
        }
        Ok(())
    }

    /// Numeric strategy parameters handed to the track script, per kind.
    fn strategy_params(kind: StrategyKind, base: &RecordConfig) -> (f64, f64, f64) {
        match kind {
            StrategyKind::Simple => (
                base.limit as f64,
                base.defer_interval as f64,
                0.0,
            ),
            StrategyKind::TokenBucket => (
                base.bucket_size.unwrap_or(1.0),
                base.refill_rate.unwrap_or(1.0),
                base.defer_interval as f64,
            ),
            StrategyKind::SlidingWindow => (
                base.limit as f64,
                base.window_size.unwrap_or(1) as f64,
                base.defer_interval as f64,
            ),
        }
    }

    async fn read_records_for_members(
        &self,
        op: &'static str,
        members: Vec<String>,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let mut conn = self.connection.write().await;
        let mut records = Vec::with_capacity(members.len());
        for member in members {
            let raw: HashMap<String, String> = conn
                .hgetall(self.record_key(&member))
                .await
                .map_err(|e| StorageError::backend(op, e))?;
            if raw.is_empty() {
                continue;
            }
            match Self::parse_record(&raw) {
                Some(record) => records.push(record),
                None => {
                    tracing::warn!(key = %member, "corrupted record hash skipped");
                }
            }
        }
        records.sort_by_key(|record| record.scheduled_send_at);
        Ok(records)
    }
}

#[async_trait]
impl StorageAdapter for RedisAdapter {
    async fn get(&self, key: &str) -> Result<Option<EventRecord>, StorageError> {
        let record_key = self.record_key(key);
        let mut conn = self.connection.write().await;

        let raw: HashMap<String, String> = conn
            .hgetall(&record_key)
            .await
            .map_err(|e| StorageError::backend("get", e))?;
        if raw.is_empty() {
            return Ok(None);
        }

        match Self::parse_record(&raw) {
            Some(record) => Ok(Some(record)),
            None => {
                // Corrupted data, delete it.
                tracing::warn!(key = %key, "corrupted record hash deleted");
                let _: () = conn
                    .del(&record_key)
                    .await
                    .map_err(|e| StorageError::backend("get", e))?;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, record: EventRecord) -> Result<(), StorageError> {
        let record_key = self.record_key(key);
        let mut conn = self.connection.write().await;

        let exists: bool = conn
            .exists(&record_key)
            .await
            .map_err(|e| StorageError::backend("set", e))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        self.queue_record_write(&mut pipe, &record_key, key, &record)?;
        if !exists {
            pipe.incr(&self.size_key, 1).ignore();
        }
        let _: () = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::backend("set", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let record_key = self.record_key(key);
        let mut conn = self.connection.write().await;

        let exists: bool = conn
            .exists(&record_key)
            .await
            .map_err(|e| StorageError::backend("delete", e))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&record_key).ignore();
        pipe.zrem(&self.deferred_key, key).ignore();
        if exists {
            pipe.cmd("DECR").arg(&self.size_key).ignore();
        }
        let _: () = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::backend("delete", e))?;
        Ok(exists)
    }

    async fn update(
        &self,
        key: &str,
        apply: &(dyn Fn(EventRecord) -> EventRecord + Send + Sync),
    ) -> Result<Option<EventRecord>, StorageError> {
        let record_key = self.record_key(key);

        for _ in 0..UPDATE_RETRY_ATTEMPTS {
            // Hold the connection for the whole WATCH..EXEC window so no other
            // operation through this adapter can slip into the transaction.
            let mut conn = self.connection.write().await;

            let _: () = redis::cmd("WATCH")
                .arg(&record_key)
                .query_async(&mut *conn)
                .await
                .map_err(|e| StorageError::backend("update", e))?;

            let raw: HashMap<String, String> = conn
                .hgetall(&record_key)
                .await
                .map_err(|e| StorageError::backend("update", e))?;

            let Some(record) = (!raw.is_empty())
                .then(|| Self::parse_record(&raw))
                .flatten()
            else {
                if !raw.is_empty() {
                    tracing::warn!(key = %key, "corrupted record hash treated as absent");
                }
                let _: () = redis::cmd("UNWATCH")
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| StorageError::backend("update", e))?;
                return Ok(None);
            };

            let updated = apply(record);
            let mut pipe = redis::pipe();
            pipe.atomic();
            self.queue_record_write(&mut pipe, &record_key, key, &updated)?;

            let committed: Option<redis::Value> = pipe
                .query_async(&mut *conn)
                .await
                .map_err(|e| StorageError::backend("update", e))?;
            if committed.is_some() {
                return Ok(Some(updated));
            }
            // Watched key changed mid-transaction; retry.
        }

        Err(StorageError::ConflictRetriesExhausted {
            key: key.to_string(),
            attempts: UPDATE_RETRY_ATTEMPTS,
        })
    }

    async fn size(&self) -> Result<usize, StorageError> {
        let mut conn = self.connection.write().await;
        let size: Option<i64> = conn
            .get(&self.size_key)
            .await
            .map_err(|e| StorageError::backend("size", e))?;
        Ok(size.unwrap_or(0).max(0) as usize)
    }

    async fn acquire_key_slot(&self, key: &str, max_keys: usize) -> Result<bool, StorageError> {
        let mut conn = self.connection.write().await;
        let admitted: i64 = self
            .acquire_script
            .key(self.record_key(key))
            .key(&self.size_key)
            .arg(max_keys as u64)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StorageError::backend("acquire_key_slot", e))?;
        Ok(admitted == 1)
    }

    async fn track(
        &self,
        key: &str,
        event: NewEvent,
        defaults: &RecordConfig,
        max_keys: usize,
        strategy: &Strategy,
    ) -> Result<TrackResult, StorageError> {
        let base = strategy.base_config(defaults);
        let kind = strategy.kind();
        let (p1, p2, p3) = Self::strategy_params(kind, &base);
        let base_json = serde_json::to_string(&base)
            .map_err(|e| StorageError::backend("track", e))?;
        let details_json = serde_json::to_string(&event.details)
            .map_err(|e| StorageError::backend("track", e))?;
        let now = self.clock.now_ms();

        let mut conn = self.connection.write().await;
        let reply: Vec<String> = self
            .track_script
            .key(self.record_key(key))
            .key(&self.deferred_key)
            .key(&self.size_key)
            .arg(key)
            .arg(&event.category)
            .arg(&event.id)
            .arg(&details_json)
            .arg(&event.details_hash)
            .arg(now)
            .arg(max_keys as u64)
            .arg(kind.as_str())
            .arg(p1)
            .arg(p2)
            .arg(p3)
            .arg(&base_json)
            .arg(base.expire_time)
            .arg(base.defer_interval)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StorageError::backend("track", e))?;
        drop(conn);

        if reply.len() == 2 && reply[0] == "ignored" {
            return Ok(TrackResult {
                outcome: Outcome::Ignored,
                reason: Some(IgnoreReason::KeyLimitReached),
                record: None,
            });
        }
        if reply.len() != 9 {
            return Err(StorageError::backend(
                "track",
                format!("unexpected script reply of {} elements", reply.len()),
            ));
        }

        let outcome = match reply[0].as_str() {
            "immediate" => Outcome::Immediate,
            "deferred" => Outcome::Deferred,
            "ignored" => Outcome::Ignored,
            other => {
                return Err(StorageError::backend(
                    "track",
                    format!("unknown outcome tag {other:?}"),
                ))
            }
        };
        let reason = match reply[1].as_str() {
            "already_deferred" => Some(IgnoreReason::AlreadyDeferred),
            _ => None,
        };

        let parse_num = |field: &'static str, raw: &str| {
            raw.parse::<u64>().map_err(|_| {
                StorageError::backend("track", format!("bad numeric field {field}: {raw:?}"))
            })
        };
        let record = EventRecord {
            key: key.to_string(),
            category: event.category,
            id: event.id,
            details: event.details,
            details_hash: event.details_hash,
            count: parse_num("count", &reply[2])?,
            last_event_time: parse_num("lastEventTime", &reply[3])?,
            expires_at: parse_num("expiresAt", &reply[4])?,
            deferred: reply[5] == "true",
            scheduled_send_at: (!reply[6].is_empty())
                .then(|| parse_num("scheduledSendAt", &reply[6]))
                .transpose()?,
            config: serde_json::from_str(&reply[7])
                .map_err(|e| StorageError::backend("track", e))?,
            strategy_data: serde_json::from_str(&reply[8])
                .map_err(|e| StorageError::backend("track", e))?,
        };

        Ok(TrackResult {
            outcome,
            reason,
            record: Some(record),
        })
    }

    async fn find_due_deferred(&self, now_ms: u64) -> Result<Vec<EventRecord>, StorageError> {
        let members: Vec<String> = {
            let mut conn = self.connection.write().await;
            conn.zrangebyscore(&self.deferred_key, "-inf", now_ms)
                .await
                .map_err(|e| StorageError::backend("find_due_deferred", e))?
        };
        self.read_records_for_members("find_due_deferred", members)
            .await
    }

    async fn pop_due_deferred(&self, now_ms: u64) -> Result<Vec<EventRecord>, StorageError> {
        let mut conn = self.connection.write().await;
        let entries: Vec<Vec<String>> = self
            .pop_script
            .key(&self.deferred_key)
            .key(&self.size_key)
            .arg(now_ms)
            .arg(&self.config.key_prefix)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StorageError::backend("pop_due_deferred", e))?;
        drop(conn);

        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            match Self::parse_script_entry(entry) {
                Some(record) => records.push(record),
                None => {
                    tracing::warn!(
                        member = entry.first().map(String::as_str).unwrap_or(""),
                        "corrupted popped record skipped"
                    );
                }
            }
        }
        records.sort_by_key(|record| record.scheduled_send_at);
        Ok(records)
    }

    async fn find_all_deferred(&self) -> Result<Vec<EventRecord>, StorageError> {
        let members: Vec<String> = {
            let mut conn = self.connection.write().await;
            conn.zrange(&self.deferred_key, 0, -1)
                .await
                .map_err(|e| StorageError::backend("find_all_deferred", e))?
        };
        self.read_records_for_members("find_all_deferred", members)
            .await
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        // The host application owns the connection; nothing to release here.
        Ok(())
    }
}

impl Clone for RedisAdapter {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            deferred_key: self.deferred_key.clone(),
            size_key: self.size_key.clone(),
            track_script: Script::new(TRACK_SCRIPT),
            pop_script: Script::new(POP_DUE_SCRIPT),
            acquire_script: Script::new(ACQUIRE_SLOT_SCRIPT),
        }
    }
}
