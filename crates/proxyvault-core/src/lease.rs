use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::warn;

use crate::proxy::ProxyId;

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: u64,
    expires_at: Instant,
}

/// 每个代理同一时间最多一个进行中的验证
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    leases: Arc<DashMap<ProxyId, Lease>>,
    next_token: Arc<AtomicU64>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得租约；已被持有且未过期时返回 None
    pub fn try_acquire(&self, id: ProxyId, ttl: Duration) -> Option<LeaseGuard> {
        let now = Instant::now();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let lease = Lease {
            token,
            expires_at: now + ttl,
        };
        match self.leases.entry(id) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return None;
                }
                warn!(id = %id, "租约已过期，被新的检查接管");
                held.insert(lease);
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
            }
        }
        Some(LeaseGuard {
            table: self.leases.clone(),
            id,
            token,
        })
    }

    pub fn is_held(&self, id: &ProxyId) -> bool {
        self.leases
            .get(id)
            .map(|lease| lease.expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

/// 释放时只移除自己持有的那份租约
#[derive(Debug)]
pub struct LeaseGuard {
    table: Arc<DashMap<ProxyId, Lease>>,
    id: ProxyId,
    token: u64,
}

impl LeaseGuard {
    pub fn id(&self) -> ProxyId {
        self.id
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let token = self.token;
        self.table.remove_if(&self.id, |_, lease| lease.token == token);
    }
}
