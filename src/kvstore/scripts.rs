//! Server-side atomic scripts (§4.1). Every mutating operation on the slot
//! store is a single round-trip Lua script so multiple gateway replicas
//! observe a linearized view of the same key without needing an in-process
//! mutex (§5). All scripts use the store's own `TIME` command instead of a
//! caller-supplied timestamp so replica clock skew never enters the picture
//! (§8 scenario 6).

/// `now_ms` prelude shared by every script that needs server time.
macro_rules! now_ms_prelude {
    () => {
        "local t = redis.call('TIME')\n\
         local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)\n"
    };
}

/// `acquireSlot(key, maxConc, ttlSeconds, memberID)`.
pub const ACQUIRE_SLOT: &str = concat!(
    now_ms_prelude!(),
    r#"
local key = KEYS[1]
local max_conc = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local member = ARGV[3]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - ttl * 1000)

if redis.call('ZSCORE', key, member) then
  redis.call('ZADD', key, now_ms, member)
  redis.call('EXPIRE', key, ttl)
  return 1
end

if redis.call('ZCARD', key) < max_conc then
  redis.call('ZADD', key, now_ms, member)
  redis.call('EXPIRE', key, ttl)
  return 1
end

return 0
"#
);

/// `releaseSlot(key, memberID)`. Idempotent: removing an absent member is a no-op.
pub const RELEASE_SLOT: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
return 1
"#;

/// `acquireSlotInRange(key, ttl, target, rangeStart, rangeEnd)`. The
/// model-pool hard-isolation primitive: never crosses the range boundary.
pub const ACQUIRE_SLOT_IN_RANGE: &str = concat!(
    now_ms_prelude!(),
    r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])
local target = tonumber(ARGV[2])
local range_start = tonumber(ARGV[3])
local range_end = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - ttl * 1000)

if target >= range_start and target < range_end and not redis.call('ZSCORE', key, tostring(target)) then
  redis.call('ZADD', key, now_ms, tostring(target))
  redis.call('EXPIRE', key, ttl)
  return target
end

for slot = range_start, range_end - 1 do
  if slot ~= target and not redis.call('ZSCORE', key, tostring(slot)) then
    redis.call('ZADD', key, now_ms, tostring(slot))
    redis.call('EXPIRE', key, ttl)
    return slot
  end
end

return -1
"#
);

/// `acquireSlotWithSession(ownerKey, slotKey, ttl, slot, session, maxParallel)`.
/// `ownerKey` is a hash `{owner, count}`; `slotKey` is the account's
/// occupancy zset. Re-checks `slotKey` before claiming a fresh owner record
/// to guard the narrow race between "release regular slot" and "acquire as
/// light-model slot" (§9 open question).
pub const ACQUIRE_SLOT_WITH_SESSION: &str = concat!(
    now_ms_prelude!(),
    r#"
local owner_key = KEYS[1]
local slot_key = KEYS[2]
local ttl = tonumber(ARGV[1])
local slot = ARGV[2]
local session = ARGV[3]
local max_parallel = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', slot_key, '-inf', now_ms - ttl * 1000)

local owner = redis.call('HGET', owner_key, 'owner')

if not owner then
  if redis.call('ZSCORE', slot_key, slot) then
    return 0
  end
  redis.call('HSET', owner_key, 'owner', session, 'count', 1)
  redis.call('EXPIRE', owner_key, ttl)
  redis.call('ZADD', slot_key, now_ms, slot)
  redis.call('EXPIRE', slot_key, ttl)
  return 1
end

if owner == session then
  local count = tonumber(redis.call('HGET', owner_key, 'count'))
  if count < max_parallel then
    redis.call('HINCRBY', owner_key, 'count', 1)
    redis.call('EXPIRE', owner_key, ttl)
    redis.call('ZADD', slot_key, now_ms, slot)
    redis.call('EXPIRE', slot_key, ttl)
    return 1
  end
end

return 0
"#
);

/// `releaseSlotWithSession(ownerKey, slotKey, slot, session)`. Only the
/// owner may decrement; at `count=0` the owner record and slot membership
/// are removed atomically.
pub const RELEASE_SLOT_WITH_SESSION: &str = r#"
local owner_key = KEYS[1]
local slot_key = KEYS[2]
local slot = ARGV[1]
local session = ARGV[2]

local owner = redis.call('HGET', owner_key, 'owner')
if owner ~= session then
  return 0
end

local count = tonumber(redis.call('HGET', owner_key, 'count'))
if count <= 1 then
  redis.call('DEL', owner_key)
  redis.call('ZREM', slot_key, slot)
else
  redis.call('HINCRBY', owner_key, 'count', -1)
end

return 1
"#;

/// `acquireSessionMutex(key, ttl, memberID)`. Set-if-absent with TTL.
pub const ACQUIRE_SESSION_MUTEX: &str = r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])
local member = ARGV[2]

if redis.call('SET', key, member, 'NX', 'EX', ttl) then
  return 1
end
return 0
"#;

/// `releaseSessionMutex(key, memberID)`. Delete iff value equals `memberID`.
pub const RELEASE_SESSION_MUTEX: &str = r#"
local key = KEYS[1]
local member = ARGV[1]

if redis.call('GET', key) == member then
  redis.call('DEL', key)
  return 1
end
return 0
"#;

/// `incrementWait(key, maxWait, ttl)`. TTL is set only on the absent->1
/// transition — refreshing it on every increment would let a broken
/// decrement path keep a zombie counter alive forever (§4.1).
pub const INCREMENT_WAIT: &str = r#"
local key = KEYS[1]
local max_wait = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local cur = tonumber(redis.call('GET', key)) or 0
if cur >= max_wait then
  return 0
end

local new_val = redis.call('INCR', key)
if new_val == 1 then
  redis.call('EXPIRE', key, ttl)
end
return 1
"#;

/// `decrementWait(key)`. Decrements only if current > 0.
pub const DECREMENT_WAIT: &str = r#"
local key = KEYS[1]
local cur = tonumber(redis.call('GET', key)) or 0
if cur > 0 then
  redis.call('DECR', key)
  return 1
end
return 0
"#;

/// `recordSlidingWindow(key, windowMs, keyTTLSeconds, memberID)`. Prunes
/// members older than the window, adds `now`, returns the post-prune count.
pub const RECORD_SLIDING_WINDOW: &str = concat!(
    now_ms_prelude!(),
    r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local member = ARGV[3]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
redis.call('ZADD', key, now_ms, member)
redis.call('EXPIRE', key, ttl)
return redis.call('ZCARD', key)
"#
);

/// `slidingWindowCount(key, windowMs)`. Prune, then read cardinality.
pub const SLIDING_WINDOW_COUNT: &str = concat!(
    now_ms_prelude!(),
    r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
return redis.call('ZCARD', key)
"#
);

/// `slidingWindowOldestScore(key, windowMs)`. Prune, then return the score
/// (ms epoch) of the oldest surviving member, or -1 if empty. Used by the
/// RPM wait to compute when the oldest entry will age out of the window.
pub const SLIDING_WINDOW_OLDEST_SCORE: &str = concat!(
    now_ms_prelude!(),
    r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #oldest == 0 then
  return -1
end
return tonumber(oldest[2])
"#
);

/// `markTimestamp(key, ttlSeconds)`. Stamps `key` with the server's own
/// `now_ms` so replica clock skew never enters the user-input pacing wait.
pub const MARK_TIMESTAMP: &str = concat!(
    now_ms_prelude!(),
    r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])
redis.call('SET', key, now_ms, 'EX', ttl)
return now_ms
"#
);

/// `pruneKey(key, cutoffMs)`. Removes members whose score is at or before
/// `cutoffMs`, used by the idle cleaner's sweep (§4.6, §8 cleaner safety).
pub const PRUNE_KEY: &str = r#"
return redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
"#;
