use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, FailureKind, Result};
use crate::proxy::ProxyId;
use crate::store::Page;

/// 默认每页条数
pub const DEFAULT_PAGE_SIZE: usize = 20;
/// 每页最多条数
pub const MAX_PAGE_SIZE: usize = 500;

/// 不可变的日志条目。proxy_id 是弱引用，代理删除后日志仍保留
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<T> {
    pub id: Uuid,
    pub proxy_id: ProxyId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: T,
}

impl<T> LogEntry<T> {
    pub fn new(proxy_id: ProxyId, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            proxy_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// 测速样本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedSample {
    pub latency_ms: u64,
    pub target_url: String,
}

/// 出口IP变化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSample {
    pub ip: String,
    pub previous_ip: Option<String>,
}

/// 访问记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitSample {
    pub source_ip: String,
    pub target_ip: String,
    pub domain: String,
}

/// 失败记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSample {
    pub kind: FailureKind,
    pub message: String,
}

/// 只对部分日志类别生效的载荷条件，其他类别忽略这些条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadFilter {
    /// 访问日志: 来源IP子串
    pub source_ip: Option<String>,
    /// 访问日志: 目标IP子串
    pub target_ip: Option<String>,
    /// 访问日志: 域名子串
    pub domain: Option<String>,
    /// 失败日志: 失败类型
    pub failure_kind: Option<FailureKind>,
}

/// 可以按 [`PayloadFilter`] 过滤的日志载荷
pub trait LogPayload: Clone + Send + Sync {
    fn matches(&self, _filter: &PayloadFilter) -> bool {
        true
    }
}

impl LogPayload for SpeedSample {}

impl LogPayload for IpSample {}

impl LogPayload for VisitSample {
    fn matches(&self, filter: &PayloadFilter) -> bool {
        contains(&self.source_ip, filter.source_ip.as_deref())
            && contains(&self.target_ip, filter.target_ip.as_deref())
            && contains(&self.domain, filter.domain.as_deref())
    }
}

impl LogPayload for FailureSample {
    fn matches(&self, filter: &PayloadFilter) -> bool {
        filter.failure_kind.map_or(true, |kind| self.kind == kind)
    }
}

/// 不区分大小写的子串匹配，空条件总是匹配
fn contains(value: &str, needle: Option<&str>) -> bool {
    match needle.map(str::trim).filter(|n| !n.is_empty()) {
        Some(needle) => value
            .to_ascii_lowercase()
            .contains(&needle.to_ascii_lowercase()),
        None => true,
    }
}

pub type SpeedLog = LogEntry<SpeedSample>;
pub type IpLog = LogEntry<IpSample>;
pub type VisitLog = LogEntry<VisitSample>;
pub type FailureLog = LogEntry<FailureSample>;

/// 按时间排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// 最新的在前
    #[default]
    Desc,
    Asc,
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desc" | "timestamp desc" => Ok(SortOrder::Desc),
            "asc" | "timestamp asc" => Ok(SortOrder::Asc),
            other => Err(Error::Validation(format!("unknown order: {}", other))),
        }
    }
}

/// 日志查询条件，时间边界为闭区间，页码从 1 开始
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub proxy_id: Option<ProxyId>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub order: SortOrder,
    pub page: usize,
    pub page_size: usize,
    pub payload: PayloadFilter,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            proxy_id: None,
            start: None,
            end: None,
            order: SortOrder::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            payload: PayloadFilter::default(),
        }
    }
}

impl LogQuery {
    pub fn for_proxy(proxy_id: ProxyId) -> Self {
        Self {
            proxy_id: Some(proxy_id),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(Error::Validation(format!(
                    "start {} is after end {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    fn matches<T: LogPayload>(&self, entry: &LogEntry<T>) -> bool {
        self.proxy_id.map_or(true, |id| entry.proxy_id == id)
            && self.start.map_or(true, |start| entry.timestamp >= start)
            && self.end.map_or(true, |end| entry.timestamp <= end)
            && entry.payload.matches(&self.payload)
    }

    fn window(&self) -> (usize, usize) {
        let page = self.page.max(1);
        let size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        ((page - 1).saturating_mul(size), size)
    }
}

/// 一类日志，独立于其他类别
#[derive(Debug)]
pub struct LogStream<T> {
    entries: Arc<RwLock<VecDeque<LogEntry<T>>>>,
    closed: Arc<AtomicBool>,
    max_entries: usize,
}

impl<T> Clone for LogStream<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            closed: self.closed.clone(),
            max_entries: self.max_entries,
        }
    }
}

impl<T: LogPayload> LogStream<T> {
    fn new(closed: Arc<AtomicBool>, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            closed,
            max_entries,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Storage("log recorder is closed".to_string()));
        }
        Ok(())
    }

    pub async fn append(&self, proxy_id: ProxyId, payload: T) -> Result<LogEntry<T>> {
        self.append_entry(LogEntry::new(proxy_id, payload)).await
    }

    pub async fn append_entry(&self, entry: LogEntry<T>) -> Result<LogEntry<T>> {
        self.check_open()?;
        let mut entries = self.entries.write().await;
        entries.push_back(entry.clone());
        self.trim(&mut entries);
        Ok(entry)
    }

    fn trim(&self, entries: &mut VecDeque<LogEntry<T>>) {
        if self.max_entries > 0 {
            while entries.len() > self.max_entries {
                entries.pop_front();
            }
        }
    }

    /// 全部条目，按追加顺序
    pub async fn entries(&self) -> Vec<LogEntry<T>> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// 整体替换当前条目，超出上限时保留最后的部分
    pub async fn restore(&self, restored: Vec<LogEntry<T>>) -> Result<usize> {
        self.check_open()?;
        let mut entries = self.entries.write().await;
        *entries = VecDeque::from(restored);
        self.trim(&mut entries);
        Ok(entries.len())
    }

    pub async fn query(&self, query: &LogQuery) -> Result<Page<LogEntry<T>>> {
        self.check_open()?;
        query.validate()?;
        let entries = self.entries.read().await;
        let mut matched: Vec<&LogEntry<T>> =
            entries.iter().filter(|e| query.matches(e)).collect();
        // 稳定排序，同一时间戳保持追加顺序
        matched.sort_by_key(|e| e.timestamp);
        if query.order == SortOrder::Desc {
            matched.reverse();
        }

        let total = matched.len();
        let (offset, limit) = query.window();
        let items = matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(Page { items, total })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// 单个代理的失败统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureStats {
    pub proxy_id: ProxyId,
    /// 统计窗口天数
    pub days: u32,
    /// 窗口内的失败次数
    pub total_failures: usize,
    /// 窗口内按类型的失败次数，没有出现的类型为 0
    pub by_kind: BTreeMap<FailureKind, usize>,
    /// 最近一次失败，不受窗口限制
    pub last_failure: Option<DateTime<Utc>>,
    /// 窗口内平均每天失败次数
    pub failures_per_day: f64,
}

impl LogStream<FailureSample> {
    /// 统计某代理最近 `days` 天的失败
    pub async fn stats(&self, proxy_id: ProxyId, days: u32) -> Result<FailureStats> {
        self.check_open()?;
        if days == 0 {
            return Err(Error::Validation("days must be at least 1".to_string()));
        }
        let since = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut by_kind: BTreeMap<FailureKind, usize> =
            FailureKind::ALL.into_iter().map(|kind| (kind, 0)).collect();
        let mut total_failures = 0;
        let mut last_failure = None;

        let entries = self.entries.read().await;
        for entry in entries.iter().filter(|e| e.proxy_id == proxy_id) {
            last_failure = last_failure.max(Some(entry.timestamp));
            if entry.timestamp > since {
                total_failures += 1;
                *by_kind.entry(entry.payload.kind).or_default() += 1;
            }
        }
        Ok(FailureStats {
            proxy_id,
            days,
            total_failures,
            by_kind,
            last_failure,
            failures_per_day: total_failures as f64 / f64::from(days),
        })
    }
}

/// 四类日志的可序列化副本
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogArchive {
    #[serde(default)]
    pub speed: Vec<SpeedLog>,
    #[serde(default)]
    pub ip: Vec<IpLog>,
    #[serde(default)]
    pub visit: Vec<VisitLog>,
    #[serde(default)]
    pub failure: Vec<FailureLog>,
}

impl LogArchive {
    pub fn len(&self) -> usize {
        self.speed.len() + self.ip.len() + self.visit.len() + self.failure.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 日志记录器，持有四类日志
#[derive(Debug, Clone)]
pub struct LogRecorder {
    pub speed: LogStream<SpeedSample>,
    pub ip: LogStream<IpSample>,
    pub visit: LogStream<VisitSample>,
    pub failure: LogStream<FailureSample>,
    closed: Arc<AtomicBool>,
}

impl LogRecorder {
    /// `max_entries_per_stream` 为 0 时不限条数
    pub fn new(max_entries_per_stream: usize) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        Self {
            speed: LogStream::new(closed.clone(), max_entries_per_stream),
            ip: LogStream::new(closed.clone(), max_entries_per_stream),
            visit: LogStream::new(closed.clone(), max_entries_per_stream),
            failure: LogStream::new(closed.clone(), max_entries_per_stream),
            closed,
        }
    }

    /// 关闭后追加与查询都返回存储错误
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("日志记录器已关闭");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn archive(&self) -> LogArchive {
        LogArchive {
            speed: self.speed.entries().await,
            ip: self.ip.entries().await,
            visit: self.visit.entries().await,
            failure: self.failure.entries().await,
        }
    }

    /// 用归档替换全部日志，返回保留的条目数
    pub async fn restore(&self, archive: LogArchive) -> Result<usize> {
        Ok(self.speed.restore(archive.speed).await?
            + self.ip.restore(archive.ip).await?
            + self.visit.restore(archive.visit).await?
            + self.failure.restore(archive.failure).await?)
    }
}

impl Default for LogRecorder {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn speed(ms: u64) -> SpeedSample {
        SpeedSample {
            latency_ms: ms,
            target_url: "http://echo.invalid/ip".to_string(),
        }
    }

    #[tokio::test]
    async fn test_query_newest_first_with_pages() {
        let logs = LogRecorder::default();
        let id = Uuid::new_v4();
        let base = Utc::now();
        for i in 0..5 {
            logs.speed
                .append_entry(LogEntry::new(id, speed(i)).at(base + Duration::seconds(i as i64)))
                .await
                .unwrap();
        }

        let query = LogQuery {
            page_size: 2,
            ..LogQuery::for_proxy(id)
        };
        let first = logs.speed.query(&query).await.unwrap();
        assert_eq!(first.total, 5);
        let latencies: Vec<_> = first.items.iter().map(|e| e.payload.latency_ms).collect();
        assert_eq!(latencies, vec![4, 3]);

        let last = logs
            .speed
            .query(&LogQuery { page: 3, ..query.clone() })
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].payload.latency_ms, 0);

        let asc = logs
            .speed
            .query(&LogQuery { order: SortOrder::Asc, ..query })
            .await
            .unwrap();
        assert_eq!(asc.items[0].payload.latency_ms, 0);
    }

    #[tokio::test]
    async fn test_time_bounds_are_inclusive() {
        let logs = LogRecorder::default();
        let id = Uuid::new_v4();
        let base = Utc::now();
        for i in 0..3 {
            logs.speed
                .append_entry(LogEntry::new(id, speed(i)).at(base + Duration::minutes(i as i64)))
                .await
                .unwrap();
        }
        let query = LogQuery {
            start: Some(base + Duration::minutes(1)),
            end: Some(base + Duration::minutes(2)),
            ..LogQuery::default()
        };
        assert_eq!(logs.speed.query(&query).await.unwrap().total, 2);

        let inverted = LogQuery {
            start: query.end,
            end: query.start,
            ..LogQuery::default()
        };
        assert!(matches!(
            logs.speed.query(&inverted).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_streams_are_independent_and_filter_by_proxy() {
        let logs = LogRecorder::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        logs.speed.append(a, speed(10)).await.unwrap();
        logs.speed.append(b, speed(20)).await.unwrap();
        logs.failure
            .append(
                a,
                FailureSample {
                    kind: FailureKind::Timeout,
                    message: "timed out".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(logs.speed.query(&LogQuery::for_proxy(a)).await.unwrap().total, 1);
        assert_eq!(logs.failure.len().await, 1);
        assert!(logs.ip.is_empty().await);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let logs = LogRecorder::new(2);
        let id = Uuid::new_v4();
        for i in 0..4 {
            logs.speed.append(id, speed(i)).await.unwrap();
        }
        let page = logs
            .speed
            .query(&LogQuery { order: SortOrder::Asc, ..LogQuery::default() })
            .await
            .unwrap();
        let latencies: Vec<_> = page.items.iter().map(|e| e.payload.latency_ms).collect();
        assert_eq!(latencies, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_close_rejects_appends_and_queries() {
        let logs = LogRecorder::default();
        let id = Uuid::new_v4();
        logs.ip
            .append(id, IpSample { ip: "203.0.113.1".into(), previous_ip: None })
            .await
            .unwrap();

        logs.close();
        assert!(logs.is_closed());
        assert!(matches!(logs.speed.append(id, speed(1)).await, Err(Error::Storage(_))));
        assert!(matches!(logs.ip.query(&LogQuery::default()).await, Err(Error::Storage(_))));
    }

    fn failure(kind: FailureKind) -> FailureSample {
        FailureSample {
            kind,
            message: kind.to_string(),
        }
    }

    fn visit(source: &str, domain: &str) -> VisitSample {
        VisitSample {
            source_ip: source.to_string(),
            target_ip: "93.184.216.34".to_string(),
            domain: domain.to_string(),
        }
    }

    #[tokio::test]
    async fn test_visit_filters_match_substrings() {
        let logs = LogRecorder::default();
        let id = Uuid::new_v4();
        logs.visit.append(id, visit("10.0.0.1", "api.Example.com")).await.unwrap();
        logs.visit.append(id, visit("10.0.0.2", "example.org")).await.unwrap();
        logs.visit.append(id, visit("192.168.1.7", "cdn.example.com")).await.unwrap();

        let by_domain = LogQuery {
            payload: PayloadFilter {
                domain: Some("example.COM".to_string()),
                ..PayloadFilter::default()
            },
            ..LogQuery::default()
        };
        assert_eq!(logs.visit.query(&by_domain).await.unwrap().total, 2);

        let narrowed = LogQuery {
            payload: PayloadFilter {
                source_ip: Some("10.0.0".to_string()),
                domain: Some("example.com".to_string()),
                ..PayloadFilter::default()
            },
            ..LogQuery::default()
        };
        let page = logs.visit.query(&narrowed).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].payload.domain, "api.Example.com");

        // 访问条件对测速日志无效
        logs.speed.append(id, speed(5)).await.unwrap();
        assert_eq!(logs.speed.query(&narrowed).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_failure_filter_by_kind() {
        let logs = LogRecorder::default();
        let id = Uuid::new_v4();
        logs.failure.append(id, failure(FailureKind::Timeout)).await.unwrap();
        logs.failure.append(id, failure(FailureKind::Auth)).await.unwrap();
        logs.failure.append(id, failure(FailureKind::Timeout)).await.unwrap();

        let query = LogQuery {
            payload: PayloadFilter {
                failure_kind: Some("connect-timeout".parse().unwrap()),
                ..PayloadFilter::default()
            },
            ..LogQuery::for_proxy(id)
        };
        let page = logs.failure.query(&query).await.unwrap();
        assert_eq!(page.total, 2);
        assert!(page.items.iter().all(|e| e.payload.kind == FailureKind::Timeout));
        assert_eq!("auth".parse::<FailureKind>().unwrap(), FailureKind::Auth);
        assert!("flaky".parse::<FailureKind>().is_err());
    }

    #[tokio::test]
    async fn test_failure_stats_window() {
        let logs = LogRecorder::default();
        let (id, other) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let at = |kind, age: Duration| LogEntry::new(id, failure(kind)).at(now - age);
        logs.failure.append_entry(at(FailureKind::Timeout, Duration::days(10))).await.unwrap();
        logs.failure.append_entry(at(FailureKind::Timeout, Duration::days(2))).await.unwrap();
        let latest = logs
            .failure
            .append_entry(at(FailureKind::Auth, Duration::hours(1)))
            .await
            .unwrap();
        logs.failure.append(other, failure(FailureKind::Aborted)).await.unwrap();

        let stats = logs.failure.stats(id, 7).await.unwrap();
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.by_kind[&FailureKind::Timeout], 1);
        assert_eq!(stats.by_kind[&FailureKind::Auth], 1);
        assert_eq!(stats.by_kind[&FailureKind::Aborted], 0);
        assert_eq!(stats.last_failure, Some(latest.timestamp));
        assert!((stats.failures_per_day - 2.0 / 7.0).abs() < 1e-9);

        let empty = logs.failure.stats(Uuid::new_v4(), 7).await.unwrap();
        assert_eq!(empty.total_failures, 0);
        assert!(empty.last_failure.is_none());
        assert!(matches!(logs.failure.stats(id, 0).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_archive_restore_respects_limit() {
        let logs = LogRecorder::new(2);
        let id = Uuid::new_v4();
        for ms in [1, 2] {
            logs.speed.append(id, speed(ms)).await.unwrap();
        }
        logs.failure.append(id, failure(FailureKind::Auth)).await.unwrap();
        let mut archive = logs.archive().await;
        assert_eq!(archive.len(), 3);
        archive.speed.push(LogEntry::new(id, speed(3)));

        let restored = LogRecorder::new(2);
        assert_eq!(restored.restore(archive).await.unwrap(), 3);
        let kept: Vec<u64> = restored
            .speed
            .entries()
            .await
            .iter()
            .map(|e| e.payload.latency_ms)
            .collect();
        assert_eq!(kept, vec![2, 3]);
        assert_eq!(restored.failure.len().await, 1);

        restored.close();
        assert!(restored.restore(LogArchive::default()).await.is_err());
    }

    #[test]
    fn test_entry_serializes_flat() {
        let entry = LogEntry::new(
            Uuid::nil(),
            VisitSample {
                source_ip: "10.0.0.1".into(),
                target_ip: "93.184.216.34".into(),
                domain: "example.com".into(),
            },
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["domain"], "example.com");
        assert_eq!(json["proxy_id"], Uuid::nil().to_string());
    }
}
