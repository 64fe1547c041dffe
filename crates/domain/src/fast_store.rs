use std::time::Duration;

use async_trait::async_trait;
use stellar_errors::StellarResult;

/// 共享快速存储（缓存/队列层）
///
/// 所有节点与调度实例只通过这些原子原语协调：带TTL的键值、
/// 不存在才写入、比较后删除、计数器、列表、有序集合、集合和发布订阅。
#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> StellarResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StellarResult<()>;
    /// 键不存在时写入，返回是否写入成功
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> StellarResult<bool>;
    /// 键的值等于 `expected` 时删除，返回是否删除
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StellarResult<bool>;
    async fn delete(&self, key: &str) -> StellarResult<bool>;
    async fn exists(&self, key: &str) -> StellarResult<bool>;
    async fn incr_by(&self, key: &str, delta: i64) -> StellarResult<i64>;

    async fn push_back(&self, key: &str, value: &str) -> StellarResult<u64>;
    async fn push_front(&self, key: &str, value: &str) -> StellarResult<u64>;
    async fn pop_front(&self, key: &str) -> StellarResult<Option<String>>;
    async fn peek_front(&self, key: &str) -> StellarResult<Option<String>>;
    /// 删除列表中所有等于 `value` 的元素，返回删除个数
    async fn list_remove(&self, key: &str, value: &str) -> StellarResult<u64>;
    async fn list_len(&self, key: &str) -> StellarResult<u64>;
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> StellarResult<Vec<String>>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> StellarResult<()>;
    /// 原子地取出并移除分数不大于 `max_score` 的成员
    async fn zpop_due(&self, key: &str, max_score: i64, limit: usize) -> StellarResult<Vec<String>>;
    async fn zremove(&self, key: &str, member: &str) -> StellarResult<bool>;
    async fn zcard(&self, key: &str) -> StellarResult<u64>;

    async fn set_add(&self, key: &str, member: &str) -> StellarResult<bool>;
    async fn set_remove(&self, key: &str, member: &str) -> StellarResult<bool>;
    async fn set_members(&self, key: &str) -> StellarResult<Vec<String>>;

    /// 发布消息，返回接收者数量
    async fn publish(&self, channel: &str, message: &str) -> StellarResult<u64>;
}
