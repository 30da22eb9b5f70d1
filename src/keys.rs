//! Key Layout
//!
//! Key prefixes shared with other services reading the same store. Changing
//! any of these breaks interoperability.

use std::time::Duration;

/// Cached shop payloads: `cache:shop:{id}`
pub const CACHE_SHOP_KEY: &str = "cache:shop:";

/// Logically expiring shop payloads: `cache:shop-hot:{id}`
pub const CACHE_SHOP_HOT_KEY: &str = "cache:shop-hot:";

/// Shop rebuild locks: `lock:shop:{id}`
pub const LOCK_SHOP_KEY: &str = "lock:shop:";

/// Cached, sorted shop-type list
pub const CACHE_SHOP_TYPE_LIST_KEY: &str = "cache:shop-type:list";

/// Per-user order persistence locks: `lock:order:{userId}`
pub const LOCK_ORDER_KEY: &str = "lock:order:";

/// Daily ID counters: `icr:{businessKey}:{yyyy:MM:dd}`
pub const ID_COUNTER_KEY: &str = "icr:";

/// Remaining seckill stock: `seckill:stock:{voucherId}`
pub const SECKILL_STOCK_KEY: &str = "seckill:stock:";

/// Set of users who already bought: `seckill:order:{voucherId}`
pub const SECKILL_ORDER_KEY: &str = "seckill:order:";

/// TTL of the "confirmed absent" sentinel
pub const CACHE_NULL_TTL: Duration = Duration::from_secs(2 * 60);

/// TTL of an ordinary cached shop
pub const CACHE_SHOP_TTL: Duration = Duration::from_secs(30 * 60);

/// TTL of a shop rebuild lock
pub const LOCK_SHOP_TTL: Duration = Duration::from_secs(10);

/// TTL of a per-user order lock
pub const LOCK_ORDER_TTL: Duration = Duration::from_secs(30);

/// Business key the order IDs are drawn from
pub const ORDER_ID_BUSINESS_KEY: &str = "order";

pub fn shop_cache_key(id: u64) -> String {
    format!("{}{}", CACHE_SHOP_KEY, id)
}

pub fn shop_hot_cache_key(id: u64) -> String {
    format!("{}{}", CACHE_SHOP_HOT_KEY, id)
}

pub fn order_lock_key(user_id: u64) -> String {
    format!("{}{}", LOCK_ORDER_KEY, user_id)
}

pub fn seckill_stock_key(voucher_id: u64) -> String {
    format!("{}{}", SECKILL_STOCK_KEY, voucher_id)
}

pub fn seckill_order_key(voucher_id: u64) -> String {
    format!("{}{}", SECKILL_ORDER_KEY, voucher_id)
}

/// `date` is already formatted as `yyyy:MM:dd`.
pub fn id_counter_key(business_key: &str, date: &str) -> String {
    format!("{}{}:{}", ID_COUNTER_KEY, business_key, date)
}
