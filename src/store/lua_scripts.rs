/// Lua script for the token bucket step
///
/// Refills the bucket for the time elapsed since the last refill, then takes
/// one token if a whole token is available.
///
/// KEYS[1] = the bucket key
/// ARGV[1] = capacity (burst size)
/// ARGV[2] = refill rate (tokens per second)
/// ARGV[3] = current timestamp (milliseconds)
/// ARGV[4] = idle expiry (milliseconds)
///
/// Returns: [allowed (0/1), remaining tokens as a string, retry_after_ms]
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_per_ms = tonumber(ARGV[2]) / 1000
local now = tonumber(ARGV[3])
local idle_ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * refill_per_ms)

local allowed = 0
local retry_after = 0

if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
else
    retry_after = math.ceil((1 - tokens) / refill_per_ms)
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', math.max(now, last_refill))
redis.call('PEXPIRE', key, idle_ttl)

return {allowed, tostring(tokens), retry_after}
"#;

/// Lua script for the sliding window log step
///
/// Entries at or before `now - window` are pruned; the call is recorded only
/// when it is admitted.
///
/// KEYS[1] = the log key
/// ARGV[1] = maximum entries per window
/// ARGV[2] = window duration (milliseconds)
/// ARGV[3] = current timestamp (milliseconds)
/// ARGV[4] = unique member for this call
///
/// Returns: [allowed (0/1), entries in window, retry_after_ms]
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
    return {1, count + 1, 0}
end

local retry_after = window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    retry_after = math.max(1, tonumber(oldest[2]) + window - now)
end

return {0, count, retry_after}
"#;

/// Lua script for counter increments with expiry on creation
///
/// KEYS[1] = the counter key
/// ARGV[1] = increment
/// ARGV[2] = expiry for a new counter (milliseconds)
///
/// Returns: the counter value after the increment
pub const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local current = redis.call('INCRBY', KEYS[1], ARGV[1])

-- A counter without expiry was just created (or lost its TTL)
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end

return current
"#;

/// Lua script deleting a key only while it holds the expected value
///
/// KEYS[1] = the key
/// ARGV[1] = expected value
///
/// Returns: 1 if deleted, 0 otherwise
pub const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Lua script replacing a key's TTL only while it holds the expected value
///
/// KEYS[1] = the key
/// ARGV[1] = expected value
/// ARGV[2] = new TTL (milliseconds)
///
/// Returns: 1 if the TTL was replaced, 0 otherwise
pub const COMPARE_AND_SET_TTL_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;
