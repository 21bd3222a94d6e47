//! Lua scripts for atomic table operations
//!
//! # Scripts Provided
//!
//! - `create_table`: register a table and its metadata
//! - `attach_combiner`: record a combiner and the families it sums
//! - `put_cells`: apply one row mutation, summing combined families
//!
//! # Example
//!
//! ```rust
//! use rollup_tsdb::redis::LuaScripts;
//!
//! let scripts = LuaScripts::new();
//! let put = scripts.put_cells();
//! assert!(std::sync::Arc::ptr_eq(&put, &scripts.put_cells()));
//! ```

use parking_lot::RwLock;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;

/// Cached Lua scripts used by the Redis store
///
/// Each script is built once and shared; `Script` hashes its source so
/// repeated invocations go through `EVALSHA`.
pub struct LuaScripts {
    cache: RwLock<HashMap<&'static str, Arc<Script>>>,
}

impl LuaScripts {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, name: &'static str, lua: &str) -> Arc<Script> {
        if let Some(script) = self.cache.read().get(name) {
            return Arc::clone(script);
        }
        let mut cache = self.cache.write();
        Arc::clone(
            cache
                .entry(name)
                .or_insert_with(|| Arc::new(Script::new(lua))),
        )
    }

    /// Register a table
    ///
    /// # Keys
    /// - KEYS[1]: table registry (`{ns}:tables`)
    /// - KEYS[2]: table metadata (`{ns}:t:{table}:meta`)
    ///
    /// # Arguments
    /// - ARGV[1]: table name
    /// - ARGV[2]: versioning flag (`0` or `1`)
    ///
    /// # Returns
    /// - 1 when created, 0 when the table already exists
    pub fn create_table(&self) -> Arc<Script> {
        self.get_or_create(
            "create_table",
            r#"
            if redis.call('SADD', KEYS[1], ARGV[1]) == 0 then
                return 0
            end
            redis.call('HSET', KEYS[2], 'versioning', ARGV[2])
            return 1
            "#,
        )
    }

    /// Record a combiner on an existing table
    ///
    /// # Keys
    /// - KEYS[1]: table registry (`{ns}:tables`)
    /// - KEYS[2]: combined families (`{ns}:t:{table}:combiners`, family -> combiner name)
    /// - KEYS[3]: iterator settings (`{ns}:t:{table}:iterators`, name -> JSON)
    ///
    /// # Arguments
    /// - ARGV[1]: table name
    /// - ARGV[2]: combiner name
    /// - ARGV[3]: combiner setting as JSON
    /// - ARGV[4..]: column families summed by the combiner
    ///
    /// # Returns
    /// - number of families registered, or -1 when the table does not exist
    pub fn attach_combiner(&self) -> Arc<Script> {
        self.get_or_create(
            "attach_combiner",
            r#"
            if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 0 then
                return -1
            end
            redis.call('HSET', KEYS[3], ARGV[2], ARGV[3])
            for i = 4, #ARGV do
                redis.call('HSET', KEYS[2], ARGV[i], ARGV[2])
            end
            return #ARGV - 3
            "#,
        )
    }

    /// Apply all column writes of one row
    ///
    /// Families listed in the combiner hash are summed with `HINCRBY`, and a
    /// sum that would overflow is clamped to the 64-bit bound in the direction
    /// of the increment. Other families keep the value with the newest cell
    /// timestamp; a write older than the stored one is ignored. The per-cell
    /// timestamp hash keeps the newest timestamp seen.
    ///
    /// # Keys
    /// - KEYS[1]: row index (`{ns}:t:{table}:rows`)
    /// - KEYS[2]: row cells (`{ns}:t:{table}:r:{row}`)
    /// - KEYS[3]: row cell timestamps (`{ns}:t:{table}:ts:{row}`)
    /// - KEYS[4]: combined families (`{ns}:t:{table}:combiners`)
    ///
    /// # Arguments
    /// - ARGV[1]: row key
    /// - then groups of four: cell field, column family, value, timestamp
    ///
    /// # Returns
    /// - number of cells written (stale uncombined writes are not counted)
    pub fn put_cells(&self) -> Arc<Script> {
        self.get_or_create(
            "put_cells",
            r#"
            redis.call('ZADD', KEYS[1], 0, ARGV[1])
            local written = 0
            for i = 2, #ARGV, 4 do
                local field = ARGV[i]
                local value = ARGV[i + 2]
                local ts = tonumber(ARGV[i + 3])
                local prev = tonumber(redis.call('HGET', KEYS[3], field))
                if redis.call('HEXISTS', KEYS[4], ARGV[i + 1]) == 1 then
                    local res = redis.pcall('HINCRBY', KEYS[2], field, value)
                    if type(res) == 'table' and res.err then
                        if not string.find(res.err, 'overflow') then
                            return redis.error_reply(res.err)
                        end
                        if string.sub(value, 1, 1) == '-' then
                            redis.call('HSET', KEYS[2], field, '-9223372036854775808')
                        else
                            redis.call('HSET', KEYS[2], field, '9223372036854775807')
                        end
                    end
                    if prev == nil or ts > prev then
                        redis.call('HSET', KEYS[3], field, ARGV[i + 3])
                    end
                    written = written + 1
                elseif prev == nil or ts >= prev then
                    redis.call('HSET', KEYS[2], field, value)
                    redis.call('HSET', KEYS[3], field, ARGV[i + 3])
                    written = written + 1
                end
            end
            return written
            "#,
        )
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_caching() {
        let scripts = LuaScripts::new();
        let first = scripts.create_table();
        let second = scripts.create_table();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.get_hash(), second.get_hash());
    }

    #[test]
    fn test_scripts_are_distinct() {
        let scripts = LuaScripts::new();
        let hashes = [
            scripts.create_table().get_hash().to_string(),
            scripts.attach_combiner().get_hash().to_string(),
            scripts.put_cells().get_hash().to_string(),
        ];
        assert_ne!(hashes[0], hashes[1]);
        assert_ne!(hashes[1], hashes[2]);
        assert_eq!(scripts.cache.read().len(), 3);
    }
}
