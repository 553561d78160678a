//! 固定几何的 KV 存储（KV 模拟负载的后端状态）。

use std::collections::HashMap;

/// 键长。
pub const KV_KEY_SIZE: usize = 16;
/// 值长。
pub const KV_VALUE_SIZE: usize = 64;

/// 键类型。
pub type KvKey = [u8; KV_KEY_SIZE];
/// 值类型。
pub type KvValue = [u8; KV_VALUE_SIZE];

/// 进程内 KV 存储。预填充 `initial_size` 条确定性数据，
/// 让模拟负载的查询大概率命中。
pub struct Kv {
    map: HashMap<KvKey, KvValue>,
}

impl Kv {
    /// 预填充构造。
    pub fn new(initial_size: usize) -> Self {
        let mut map = HashMap::with_capacity(initial_size);
        for i in 0..initial_size as u64 {
            let mut key = [0u8; KV_KEY_SIZE];
            key[..8].copy_from_slice(&i.to_le_bytes());
            let mut value = [0u8; KV_VALUE_SIZE];
            value[..8].copy_from_slice(&(i.wrapping_mul(0x12345).wrapping_add(0x0105_01)).to_le_bytes());
            map.insert(key, value);
        }
        Self { map }
    }

    /// 写入。
    pub fn put(&mut self, key: KvKey, value: KvValue) {
        self.map.insert(key, value);
    }

    /// 查询。
    pub fn get(&self, key: &KvKey) -> Option<&KvValue> {
        self.map.get(key)
    }

    /// 条目数。
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
