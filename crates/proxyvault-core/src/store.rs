use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::codec::{ImportReport, LineError, LineErrorKind, ParseOutcome};
use crate::error::{Error, Result};
use crate::proxy::{DedupKey, Proxy, ProxyId, ProxyPatch, ProxySpec, VerificationState};
use crate::verifier::VerificationResult;

/// 默认每页条数
pub const DEFAULT_PAGE_LIMIT: usize = 100;
/// 每页最多条数
pub const MAX_PAGE_LIMIT: usize = 1000;

/// 排序字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Latency,
    LastChecked,
    Host,
    CreatedAt,
}

impl FromStr for SortKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latency" => Ok(SortKey::Latency),
            "last_checked" => Ok(SortKey::LastChecked),
            "host" => Ok(SortKey::Host),
            "created_at" => Ok(SortKey::CreatedAt),
            other => Err(Error::Validation(format!("unknown sort key: {}", other))),
        }
    }
}

/// 列表过滤条件，缺省时按插入顺序返回全部
#[derive(Debug, Clone, Default)]
pub struct ProxyFilter {
    pub state: Option<VerificationState>,
    /// 在 host 和名称中不区分大小写查找
    pub search: Option<String>,
    pub sort: Option<SortKey>,
    pub descending: bool,
}

impl ProxyFilter {
    fn matches(&self, proxy: &Proxy) -> bool {
        if let Some(state) = self.state {
            if proxy.state() != state {
                return false;
            }
        }
        if let Some(needle) = self.search.as_deref().map(str::to_ascii_lowercase) {
            let in_host = proxy.host.contains(&needle);
            let in_name = proxy
                .name
                .as_deref()
                .map(|n| n.to_ascii_lowercase().contains(&needle))
                .unwrap_or(false);
            if !in_host && !in_name {
                return false;
            }
        }
        true
    }
}

/// 偏移分页
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_LIMIT)
    }
}

/// 一页结果以及过滤后的总数
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Default)]
struct StoreInner {
    proxies: HashMap<ProxyId, Proxy>,
    /// 插入顺序
    order: Vec<ProxyId>,
    keys: HashMap<DedupKey, ProxyId>,
}

impl StoreInner {
    fn insert(&mut self, spec: ProxySpec) -> Result<Proxy> {
        let spec = spec.normalized()?;
        let key = spec.dedup_key();
        if let Some(existing) = self.keys.get(&key) {
            return Err(Error::Duplicate(format!("{} already exists as {}", key, existing)));
        }
        let proxy = Proxy::new(spec);
        self.keys.insert(key, proxy.id);
        self.order.push(proxy.id);
        self.proxies.insert(proxy.id, proxy.clone());
        Ok(proxy)
    }

    fn get_mut(&mut self, id: ProxyId) -> Result<&mut Proxy> {
        self.proxies.get_mut(&id).ok_or(Error::NotFound(id))
    }
}

/// 代理记录存储
#[derive(Debug, Clone, Default)]
pub struct ProxyStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ProxyStore {
    /// 创建空存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加代理
    pub async fn create(&self, spec: ProxySpec) -> Result<Proxy> {
        let mut inner = self.inner.write().await;
        let proxy = inner.insert(spec)?;
        info!(id = %proxy.id, proxy = %proxy, "代理已添加");
        Ok(proxy)
    }

    /// 更新代理字段
    pub async fn update(&self, id: ProxyId, patch: ProxyPatch) -> Result<Proxy> {
        let mut inner = self.inner.write().await;
        let current = inner.proxies.get(&id).ok_or(Error::NotFound(id))?;
        let old_key = current.dedup_key();
        let (updated, identity_changed) = current.patched(&patch)?;

        let new_key = updated.dedup_key();
        if new_key != old_key {
            if let Some(other) = inner.keys.get(&new_key) {
                return Err(Error::Duplicate(format!("{} already exists as {}", new_key, other)));
            }
            inner.keys.remove(&old_key);
            inner.keys.insert(new_key, id);
        }
        inner.proxies.insert(id, updated.clone());
        info!(id = %id, identity_changed, "代理已更新");
        Ok(updated)
    }

    /// 删除代理，历史日志保留
    pub async fn delete(&self, id: ProxyId) -> Result<Proxy> {
        let mut inner = self.inner.write().await;
        let removed = inner.proxies.remove(&id).ok_or(Error::NotFound(id))?;
        inner.keys.remove(&removed.dedup_key());
        inner.order.retain(|other| *other != id);
        info!(id = %id, proxy = %removed, "代理已删除");
        Ok(removed)
    }

    pub async fn get(&self, id: ProxyId) -> Result<Proxy> {
        let inner = self.inner.read().await;
        inner.proxies.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    /// 按请求顺序取多个代理，任一不存在即报错
    pub async fn get_many(&self, ids: &[ProxyId]) -> Result<Vec<Proxy>> {
        let inner = self.inner.read().await;
        ids.iter()
            .map(|id| inner.proxies.get(id).cloned().ok_or(Error::NotFound(*id)))
            .collect()
    }

    pub async fn list(&self, filter: &ProxyFilter, page: PageRequest) -> Page<Proxy> {
        let inner = self.inner.read().await;
        let mut items: Vec<Proxy> = inner
            .order
            .iter()
            .filter_map(|id| inner.proxies.get(id))
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        drop(inner);

        if let Some(key) = filter.sort {
            match key {
                SortKey::Latency => items.sort_by_key(|p| {
                    (p.health.latency_ms.is_none(), p.health.latency_ms)
                }),
                SortKey::LastChecked => items.sort_by_key(|p| p.health.last_checked),
                SortKey::Host => {
                    items.sort_by(|a, b| a.host.cmp(&b.host).then(a.port.cmp(&b.port)))
                }
                SortKey::CreatedAt => items.sort_by_key(|p| p.created_at),
            }
        }
        if filter.descending {
            items.reverse();
        }

        let total = items.len();
        let items = items
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Page { items, total }
    }

    /// 按插入顺序返回全部代理
    pub async fn all(&self) -> Vec<Proxy> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.proxies.get(id).cloned())
            .collect()
    }

    pub async fn ids(&self) -> Vec<ProxyId> {
        self.inner.read().await.order.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 导入解析好的记录，重复项逐行报告
    pub async fn import(&self, parsed: ParseOutcome) -> ImportReport {
        let mut report = ImportReport {
            imported: 0,
            line_errors: parsed.line_errors,
        };
        let mut inner = self.inner.write().await;
        for (line, spec) in parsed.records {
            match inner.insert(spec) {
                Ok(_) => report.imported += 1,
                Err(Error::Duplicate(reason)) => report.line_errors.push(LineError {
                    line,
                    kind: LineErrorKind::Duplicate,
                    reason,
                }),
                Err(e) => report.line_errors.push(LineError {
                    line,
                    kind: LineErrorKind::Malformed,
                    reason: e.to_string(),
                }),
            }
        }
        drop(inner);
        report.line_errors.sort_by_key(|e| e.line);
        info!(
            imported = report.imported,
            errors = report.line_errors.len(),
            "导入完成"
        );
        report
    }

    /// 标记检查开始
    pub async fn begin_check(&self, id: ProxyId) -> Result<Proxy> {
        let mut inner = self.inner.write().await;
        let proxy = inner.get_mut(id)?;
        proxy.health.state = VerificationState::Pending;
        Ok(proxy.clone())
    }

    /// 写入一次验证产生的状态迁移。`epoch` 是检查开始时代理的端点版本，
    /// 检查期间端点被修改过的结果属于旧端点，按冲突丢弃
    pub async fn apply_result(&self, result: &VerificationResult, epoch: u64) -> Result<Proxy> {
        let mut inner = self.inner.write().await;
        let proxy = inner.get_mut(result.proxy_id)?;
        if proxy.epoch != epoch {
            return Err(Error::Conflict(format!(
                "result for {} belongs to endpoint version {}, current is {}",
                result.proxy_id, epoch, proxy.epoch
            )));
        }
        if let Some(last) = proxy.health.last_checked {
            if result.checked_at < last {
                return Err(Error::Conflict(format!(
                    "result for {} from {} is older than {}",
                    result.proxy_id, result.checked_at, last
                )));
            }
        }
        let previous = proxy.health.state;
        proxy.health.apply(result);
        if let Some(ip) = result.exit_ip.as_deref().filter(|_| result.success) {
            if proxy.exit_ip.as_deref() != Some(ip) {
                proxy.exit_ip = Some(ip.to_string());
                proxy.last_ip_change = Some(result.checked_at);
            }
        }
        debug!(
            id = %proxy.id,
            from = %previous,
            to = %proxy.health.state,
            failures = proxy.health.consecutive_failures,
            "状态迁移"
        );
        Ok(proxy.clone())
    }

    /// 从快照恢复，残留的 Pending 归为 Failed
    pub async fn restore(&self, proxies: Vec<Proxy>) -> usize {
        let mut inner = self.inner.write().await;
        let mut restored = 0;
        for mut proxy in proxies {
            let key = proxy.dedup_key();
            if inner.keys.contains_key(&key) || inner.proxies.contains_key(&proxy.id) {
                warn!(id = %proxy.id, "快照中有重复代理，已跳过");
                continue;
            }
            if proxy.health.settle_pending() {
                warn!(id = %proxy.id, "快照中的检查未完成，已标记为失败");
            }
            inner.keys.insert(key, proxy.id);
            inner.order.push(proxy.id);
            inner.proxies.insert(proxy.id, proxy);
            restored += 1;
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::error::ProbeError;
    use crate::proxy::ProxyKind;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    async fn seeded(hosts: &[&str]) -> (ProxyStore, Vec<Proxy>) {
        let store = ProxyStore::new();
        let mut created = Vec::new();
        for host in hosts {
            created.push(store.create(ProxySpec::new(*host, 8080)).await.unwrap());
        }
        (store, created)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = ProxyStore::new();
        store
            .create(ProxySpec::new("1.2.3.4", 8080).with_auth("u", "a"))
            .await
            .unwrap();
        let dup = store
            .create(ProxySpec::new("1.2.3.4", 8080).with_auth("u", "b"))
            .await;
        assert!(matches!(dup, Err(Error::Duplicate(_))));
        // 不同用户名是另一个代理
        store
            .create(ProxySpec::new("1.2.3.4", 8080).with_auth("v", "a"))
            .await
            .unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_update_and_delete_unknown_id() {
        let store = ProxyStore::new();
        let id = ProxyId::new_v4();
        assert!(matches!(
            store.update(id, ProxyPatch::default()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(store.delete(id).await, Err(Error::NotFound(_))));
        assert!(matches!(store.get(id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_checks_uniqueness() {
        let (store, created) = seeded(&["10.0.0.1", "10.0.0.2"]).await;
        let clash = ProxyPatch {
            host: Some("10.0.0.1".to_string()),
            ..ProxyPatch::default()
        };
        assert!(matches!(
            store.update(created[1].id, clash).await,
            Err(Error::Duplicate(_))
        ));

        let moved = ProxyPatch {
            host: Some("10.0.0.3".to_string()),
            kind: Some(ProxyKind::Socks5),
            ..ProxyPatch::default()
        };
        let updated = store.update(created[1].id, moved).await.unwrap();
        assert_eq!(updated.host, "10.0.0.3");
        // 旧键已释放
        store.create(ProxySpec::new("10.0.0.2", 8080)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_keeps_insertion_order_and_paginates() {
        let (store, created) = seeded(&["c.example", "a.example", "b.example"]).await;
        let page = store.list(&ProxyFilter::default(), PageRequest::new(1, 1)).await;
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, created[1].id);

        let by_host = ProxyFilter {
            sort: Some(SortKey::Host),
            ..ProxyFilter::default()
        };
        let page = store.list(&by_host, PageRequest::default()).await;
        let hosts: Vec<_> = page.items.iter().map(|p| p.host.as_str()).collect();
        assert_eq!(hosts, vec!["a.example", "b.example", "c.example"]);

        let search = ProxyFilter {
            search: Some("B.EX".to_string()),
            ..ProxyFilter::default()
        };
        assert_eq!(store.list(&search, PageRequest::default()).await.total, 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_state() {
        let (store, created) = seeded(&["10.0.0.1", "10.0.0.2"]).await;
        store.begin_check(created[0].id).await.unwrap();
        store
            .apply_result(&VerificationResult::success(
                created[0].id,
                Duration::from_millis(80),
                None,
            ), 0)
            .await
            .unwrap();
        let verified = ProxyFilter {
            state: Some(VerificationState::Verified),
            ..ProxyFilter::default()
        };
        let page = store.list(&verified, PageRequest::default()).await;
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, created[0].id);
    }

    #[tokio::test]
    async fn test_apply_result_writes_health_and_exit_ip() {
        let (store, created) = seeded(&["10.0.0.1"]).await;
        let id = created[0].id;
        let pending = store.begin_check(id).await.unwrap();
        assert_eq!(pending.state(), VerificationState::Pending);

        let ok = VerificationResult::success(id, Duration::from_millis(42), Some("203.0.113.1".into()));
        let proxy = store.apply_result(&ok, pending.epoch).await.unwrap();
        assert_eq!(proxy.state(), VerificationState::Verified);
        assert_eq!(proxy.health.latency_ms, Some(42));
        assert_eq!(proxy.exit_ip.as_deref(), Some("203.0.113.1"));
        assert!(proxy.last_ip_change.is_some());

        let failed = VerificationResult::failure(id, ProbeError::timeout(1000));
        let proxy = store.apply_result(&failed, pending.epoch).await.unwrap();
        assert_eq!(proxy.state(), VerificationState::Failed);
        assert_eq!(proxy.health.consecutive_failures, 1);
        // 失败不清除最后一次看到的出口IP
        assert_eq!(proxy.exit_ip.as_deref(), Some("203.0.113.1"));
    }

    #[tokio::test]
    async fn test_apply_result_rejects_stale_result() {
        let (store, created) = seeded(&["10.0.0.1"]).await;
        let id = created[0].id;
        let newer = VerificationResult::success(id, Duration::from_millis(10), None);
        let older = VerificationResult::failure(id, ProbeError::timeout(10))
            .at(newer.checked_at - ChronoDuration::seconds(5));
        store.apply_result(&newer, 0).await.unwrap();
        assert!(matches!(store.apply_result(&older, 0).await, Err(Error::Conflict(_))));
        assert_eq!(store.get(id).await.unwrap().state(), VerificationState::Verified);
    }

    #[tokio::test]
    async fn test_result_for_edited_endpoint_is_rejected() {
        let (store, created) = seeded(&["10.0.0.1"]).await;
        let id = created[0].id;
        let pending = store.begin_check(id).await.unwrap();

        let edited = store
            .update(id, ProxyPatch { port: Some(9090), ..ProxyPatch::default() })
            .await
            .unwrap();
        assert_eq!(edited.epoch, pending.epoch + 1);
        assert_eq!(edited.state(), VerificationState::Unverified);

        let old_endpoint = VerificationResult::success(id, Duration::from_millis(30), Some("203.0.113.1".into()));
        assert!(matches!(
            store.apply_result(&old_endpoint, pending.epoch).await,
            Err(Error::Conflict(_))
        ));
        let current = store.get(id).await.unwrap();
        assert_eq!(current.port, 9090);
        assert_eq!(current.state(), VerificationState::Unverified);
        assert!(current.exit_ip.is_none());

        // 只改名字不影响端点版本
        let renamed = store
            .update(id, ProxyPatch { name: Some(Some("edge".into())), ..ProxyPatch::default() })
            .await
            .unwrap();
        assert_eq!(renamed.epoch, edited.epoch);
    }

    #[tokio::test]
    async fn test_import_reports_malformed_and_duplicate_lines() {
        let store = ProxyStore::new();
        let parsed = codec::parse("1.2.3.4:8080\nbad-line\n1.2.3.4:8080", ProxyKind::Http);
        let report = store.import(parsed).await;
        assert_eq!(report.imported, 1);
        assert_eq!(report.line_errors.len(), 2);
        assert_eq!(report.line_errors[0].line, 2);
        assert_eq!(report.line_errors[0].kind, LineErrorKind::Malformed);
        assert_eq!(report.line_errors[1].line, 3);
        assert_eq!(report.line_errors[1].kind, LineErrorKind::Duplicate);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_restore_settles_pending() {
        let (source, created) = seeded(&["10.0.0.1", "10.0.0.2"]).await;
        source.begin_check(created[0].id).await.unwrap();
        let snapshot = source.all().await;

        let store = ProxyStore::new();
        assert_eq!(store.restore(snapshot.clone()).await, 2);
        assert_eq!(store.restore(snapshot).await, 0);
        let restored = store.get(created[0].id).await.unwrap();
        assert_eq!(restored.state(), VerificationState::Failed);
        assert_eq!(store.ids().await, vec![created[0].id, created[1].id]);
    }
}
