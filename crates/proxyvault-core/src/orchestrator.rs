use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, FailureKind, ProbeError, Result};
use crate::lease::{LeaseGuard, LeaseTable};
use crate::logs::{FailureSample, IpSample, LogRecorder, SpeedSample};
use crate::proxy::{Proxy, ProxyId};
use crate::settings::{SettingsStore, MAX_CONCURRENCY};
use crate::snapshot::Snapshot;
use crate::store::ProxyStore;
use crate::verifier::{Probe, ProbeTarget, VerificationResult, Verifier};

const EVENT_CAPACITY: usize = 1024;

/// 批次中未执行检查的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// 已有检查在进行
    Conflict,
    NotFound,
    /// 批次被取消，未派发
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Conflict => write!(f, "conflict"),
            SkipReason::NotFound => write!(f, "not_found"),
            SkipReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub proxy_id: ProxyId,
    pub kind: SkipReason,
    pub message: String,
}

impl BatchItemError {
    fn new(proxy_id: ProxyId, kind: SkipReason, message: impl Into<String>) -> Self {
        Self {
            proxy_id,
            kind,
            message: message.into(),
        }
    }

    fn into_error(self) -> Error {
        match self.kind {
            SkipReason::NotFound => Error::NotFound(self.proxy_id),
            SkipReason::Conflict | SkipReason::Cancelled => Error::Conflict(self.message),
        }
    }
}

/// 批量验证汇总。succeeded + failed + skipped 等于去重后的ID数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<BatchItemError>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

enum Outcome {
    Verified,
    Failed,
    Skipped(BatchItemError),
}

/// 后台运行的批次
#[derive(Debug)]
pub struct BatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<BatchSummary>>,
}

impl BatchHandle {
    /// 停止派发，进行中的探测会跑完
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<BatchSummary> {
        self.task
            .await
            .map_err(|e| Error::Storage(format!("batch task failed: {}", e)))?
    }
}

/// 批量验证调度
#[derive(Clone)]
pub struct Orchestrator {
    store: ProxyStore,
    logs: LogRecorder,
    settings: SettingsStore,
    leases: LeaseTable,
    probe: Arc<dyn Probe>,
    events: broadcast::Sender<VerificationResult>,
}

impl Orchestrator {
    pub fn new(
        store: ProxyStore,
        logs: LogRecorder,
        settings: SettingsStore,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            logs,
            settings,
            leases: LeaseTable::new(),
            probe,
            events,
        }
    }

    /// 按配置创建引擎，配置了快照且文件存在时从快照恢复
    pub async fn from_config(config: &Config) -> Result<Self> {
        let orchestrator = Self::new(
            ProxyStore::new(),
            LogRecorder::new(config.storage.max_log_entries),
            SettingsStore::new(config.verify.clone())?,
            Arc::new(Verifier::new()),
        );
        if let Some(path) = config.storage.snapshot_path() {
            if let Some(snapshot) = Snapshot::load(&path).await? {
                snapshot
                    .restore_into(&orchestrator.store, &orchestrator.settings, &orchestrator.logs)
                    .await;
            }
        }
        Ok(orchestrator)
    }

    pub fn store(&self) -> &ProxyStore {
        &self.store
    }

    pub fn logs(&self) -> &LogRecorder {
        &self.logs
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// 订阅每个验证结果
    pub fn subscribe(&self) -> broadcast::Receiver<VerificationResult> {
        self.events.subscribe()
    }

    /// 验证一批代理。concurrency 为 None 时使用当前设置
    pub async fn verify_batch(
        &self,
        ids: &[ProxyId],
        concurrency: Option<usize>,
    ) -> Result<BatchSummary> {
        self.verify_batch_with_cancel(ids, concurrency, CancellationToken::new())
            .await
    }

    pub async fn verify_batch_with_cancel(
        &self,
        ids: &[ProxyId],
        concurrency: Option<usize>,
        cancel: CancellationToken,
    ) -> Result<BatchSummary> {
        if ids.is_empty() {
            return Err(Error::Validation("no proxy ids given".to_string()));
        }

        // 每个批次只读一次设置
        let settings = self.settings.current().await;
        let concurrency = concurrency
            .unwrap_or(settings.concurrency)
            .clamp(1, MAX_CONCURRENCY);
        let target = settings.probe_target();
        let ttl = target.timeout * 2 + Duration::from_secs(5);

        let mut seen = HashSet::new();
        let ids: Vec<ProxyId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        info!(count = ids.len(), concurrency, target = %target.url, "开始批量验证");

        let mut outcomes = stream::iter(ids)
            .map(|id| self.run_one(id, target.clone(), ttl, cancel.clone()))
            .buffer_unordered(concurrency);

        let mut summary = BatchSummary::default();
        while let Some(outcome) = outcomes.next().await {
            match outcome? {
                Outcome::Verified => summary.succeeded += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Skipped(item) => {
                    summary.skipped += 1;
                    summary.errors.push(item);
                }
            }
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "批量验证完成"
        );
        Ok(summary)
    }

    /// 在后台运行批次
    pub fn spawn_batch(&self, ids: Vec<ProxyId>, concurrency: Option<usize>) -> BatchHandle {
        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            this.verify_batch_with_cancel(&ids, concurrency, token).await
        });
        BatchHandle { cancel, task }
    }

    /// 验证池中全部代理，空池直接返回
    pub async fn verify_all(&self, cancel: CancellationToken) -> Result<BatchSummary> {
        let ids = self.store.ids().await;
        if ids.is_empty() {
            return Ok(BatchSummary::default());
        }
        self.verify_batch_with_cancel(&ids, None, cancel).await
    }

    /// 验证单个代理并返回更新后的记录
    pub async fn verify_proxy(&self, id: ProxyId) -> Result<Proxy> {
        let summary = self.verify_batch(&[id], Some(1)).await?;
        if let Some(item) = summary.errors.into_iter().next() {
            return Err(item.into_error());
        }
        self.store.get(id).await
    }

    async fn run_one(
        &self,
        id: ProxyId,
        target: ProbeTarget,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::Skipped(BatchItemError::new(
                id,
                SkipReason::Cancelled,
                "batch cancelled before dispatch",
            )));
        }
        let Some(lease) = self.leases.try_acquire(id, ttl) else {
            debug!(id = %id, "已有检查在进行，跳过");
            return Ok(Outcome::Skipped(BatchItemError::new(
                id,
                SkipReason::Conflict,
                format!("verification of {} already in flight", id),
            )));
        };
        let proxy = match self.store.begin_check(id).await {
            Ok(proxy) => proxy,
            Err(Error::NotFound(_)) => {
                return Ok(Outcome::Skipped(BatchItemError::new(
                    id,
                    SkipReason::NotFound,
                    format!("proxy {} not found", id),
                )))
            }
            Err(e) => return Err(e),
        };

        // 检查在独立任务中完成，调用方放弃等待也不会留下 Pending
        let this = self.clone();
        let task = tokio::spawn(async move { this.check(lease, proxy, target).await });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(id = %id, error = %e, "验证任务异常退出");
                Err(Error::Storage(format!("verification task for {} failed: {}", id, e)))
            }
        }
    }

    async fn check(&self, _lease: LeaseGuard, proxy: Proxy, target: ProbeTarget) -> Result<Outcome> {
        let probed = AssertUnwindSafe(self.probe.probe(&proxy, &target))
            .catch_unwind()
            .await;
        let mut result = match probed {
            Ok(result) => result,
            Err(_) => {
                error!(proxy = %proxy, "探测异常终止");
                VerificationResult::failure(
                    proxy.id,
                    ProbeError::new(FailureKind::Aborted, "probe panicked"),
                )
            }
        };
        result.proxy_id = proxy.id;
        self.record(&proxy, &target, result).await
    }

    async fn record(
        &self,
        proxy: &Proxy,
        target: &ProbeTarget,
        result: VerificationResult,
    ) -> Result<Outcome> {
        let id = proxy.id;
        let updated = match self.store.apply_result(&result, proxy.epoch).await {
            Ok(updated) => updated,
            Err(Error::NotFound(_)) => {
                debug!(id = %id, "代理在检查期间被删除");
                return Ok(Outcome::Skipped(BatchItemError::new(
                    id,
                    SkipReason::NotFound,
                    format!("proxy {} was deleted during verification", id),
                )));
            }
            Err(Error::Conflict(message)) => {
                warn!(id = %id, "丢弃过期的验证结果");
                return Ok(Outcome::Skipped(BatchItemError::new(id, SkipReason::Conflict, message)));
            }
            Err(e) => return Err(e),
        };
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(result.clone());

        if result.success {
            if let Some(latency_ms) = result.latency_ms() {
                self.logs
                    .speed
                    .append(
                        id,
                        SpeedSample {
                            latency_ms,
                            target_url: target.url.clone(),
                        },
                    )
                    .await?;
            }
            // 与检查开始前记录的出口IP比较，快照恢复后的首次检查不会误报
            let previous = proxy.exit_ip.clone();
            if let Some(ip) = updated.exit_ip.clone().filter(|ip| previous.as_ref() != Some(ip)) {
                info!(proxy = %proxy, ip = %ip, previous = ?previous, "出口IP变化");
                self.logs
                    .ip
                    .append(id, IpSample { ip, previous_ip: previous })
                    .await?;
            }
            Ok(Outcome::Verified)
        } else {
            let err = result
                .error
                .unwrap_or_else(|| ProbeError::new(FailureKind::Aborted, "no error reported"));
            debug!(proxy = %proxy, error = %err, "代理验证失败");
            self.logs
                .failure
                .append(
                    id,
                    FailureSample {
                        kind: err.kind,
                        message: err.message,
                    },
                )
                .await?;
            Ok(Outcome::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogQuery;
    use crate::proxy::{ProxyPatch, ProxySpec, VerificationState};
    use crate::settings::Settings;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Clone)]
    enum Script {
        Ok(Option<&'static str>),
        Timeout,
        Panic,
    }

    /// 按 host 返回预设结果的探测器
    struct ScriptedProbe {
        delay: Duration,
        scripts: Mutex<HashMap<String, Script>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                scripts: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn script(&self, host: &str, script: Script) {
            self.scripts.lock().unwrap().insert(host.to_string(), script);
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, proxy: &Proxy, _target: &ProbeTarget) -> VerificationResult {
            let started = Instant::now();
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(&proxy.host)
                .cloned()
                .unwrap_or(Script::Ok(None));
            match script {
                Script::Ok(ip) => {
                    VerificationResult::success(proxy.id, started.elapsed(), ip.map(str::to_string))
                }
                Script::Timeout => VerificationResult::failure(proxy.id, ProbeError::timeout(10)),
                Script::Panic => panic!("scripted probe panic"),
            }
        }
    }

    async fn engine(probe: Arc<ScriptedProbe>, hosts: &[&str]) -> (Orchestrator, Vec<ProxyId>) {
        let settings = SettingsStore::new(Settings {
            timeout_secs: 1,
            ..Settings::default()
        })
        .unwrap();
        let orchestrator = Orchestrator::new(ProxyStore::new(), LogRecorder::default(), settings, probe);
        let mut ids = Vec::new();
        for host in hosts {
            let proxy = orchestrator
                .store()
                .create(ProxySpec::new(*host, 8080))
                .await
                .unwrap();
            ids.push(proxy.id);
        }
        (orchestrator, ids)
    }

    #[test_log::test(tokio::test)]
    async fn test_one_timeout_in_batch_of_three() {
        let probe = ScriptedProbe::new(Duration::from_millis(5));
        probe.script("b.example", Script::Timeout);
        let (orchestrator, ids) = engine(probe, &["a.example", "b.example", "c.example"]).await;

        let summary = orchestrator.verify_batch(&ids, None).await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);

        let store = orchestrator.store();
        assert_eq!(store.get(ids[0]).await.unwrap().state(), VerificationState::Verified);
        assert_eq!(store.get(ids[2]).await.unwrap().state(), VerificationState::Verified);
        let b = store.get(ids[1]).await.unwrap();
        assert_eq!(b.state(), VerificationState::Failed);
        assert_eq!(b.health.consecutive_failures, 1);
        assert_eq!(b.health.last_failure, Some(FailureKind::Timeout));

        let logs = orchestrator.logs();
        assert_eq!(logs.speed.len().await, 2);
        assert_eq!(logs.failure.len().await, 1);
        assert!(orchestrator.leases().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrency_is_bounded() {
        let probe = ScriptedProbe::new(Duration::from_millis(20));
        let hosts: Vec<String> = (0..20).map(|i| format!("h{}.example", i)).collect();
        let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
        let (orchestrator, ids) = engine(probe.clone(), &host_refs).await;

        let summary = orchestrator.verify_batch(&ids, Some(3)).await.unwrap();
        assert_eq!(summary.succeeded, 20);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 20);
        assert!(probe.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(orchestrator.logs().speed.len().await, 20);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let (orchestrator, _) = engine(ScriptedProbe::new(Duration::ZERO), &[]).await;
        assert!(matches!(
            orchestrator.verify_batch(&[], None).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicates_and_unknown_ids() {
        let probe = ScriptedProbe::new(Duration::ZERO);
        let (orchestrator, ids) = engine(probe.clone(), &["a.example"]).await;
        let unknown = ProxyId::new_v4();

        let summary = orchestrator
            .verify_batch(&[ids[0], ids[0], unknown], None)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total(), 2);
        assert_eq!(summary.errors[0].proxy_id, unknown);
        assert_eq!(summary.errors[0].kind, SkipReason::NotFound);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            orchestrator.verify_proxy(unknown).await,
            Err(Error::NotFound(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_overlapping_batches_do_not_double_check() {
        let probe = ScriptedProbe::new(Duration::from_millis(200));
        let (orchestrator, ids) = engine(probe.clone(), &["a.example"]).await;

        let running = orchestrator.spawn_batch(ids.clone(), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            orchestrator.store().get(ids[0]).await.unwrap().state(),
            VerificationState::Pending
        );

        let second = orchestrator.verify_batch(&ids, None).await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.errors[0].kind, SkipReason::Conflict);
        assert!(matches!(
            orchestrator.verify_proxy(ids[0]).await,
            Err(Error::Conflict(_))
        ));

        let first = running.wait().await.unwrap();
        assert_eq!(first.succeeded, 1);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_edit_during_check_discards_old_endpoint_result() {
        let probe = ScriptedProbe::new(Duration::from_millis(200));
        probe.script("a.example", Script::Ok(Some("203.0.113.1")));
        let (orchestrator, ids) = engine(probe, &["a.example"]).await;

        let running = orchestrator.spawn_batch(ids.clone(), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let patch = ProxyPatch {
            port: Some(9090),
            ..ProxyPatch::default()
        };
        orchestrator.store().update(ids[0], patch).await.unwrap();

        let summary = running.wait().await.unwrap();
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors[0].kind, SkipReason::Conflict);

        let proxy = orchestrator.store().get(ids[0]).await.unwrap();
        assert_eq!(proxy.port, 9090);
        assert_eq!(proxy.state(), VerificationState::Unverified);
        assert!(proxy.health.latency_ms.is_none());
        assert!(proxy.exit_ip.is_none());
        assert!(orchestrator.logs().speed.is_empty().await);
        assert!(orchestrator.logs().ip.is_empty().await);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_stops_dispatch() {
        let probe = ScriptedProbe::new(Duration::from_millis(50));
        let hosts: Vec<String> = (0..10).map(|i| format!("h{}.example", i)).collect();
        let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
        let (orchestrator, ids) = engine(probe.clone(), &host_refs).await;

        let handle = orchestrator.spawn_batch(ids.clone(), Some(1));
        tokio::time::sleep(Duration::from_millis(75)).await;
        handle.cancel();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.total(), 10);
        assert!(summary.succeeded >= 1);
        assert!(summary.skipped >= 5);
        assert!(summary.errors.iter().all(|e| e.kind == SkipReason::Cancelled));
        assert_eq!(probe.calls.load(Ordering::SeqCst), summary.succeeded);
        for id in ids {
            let state = orchestrator.store().get(id).await.unwrap().state();
            assert_ne!(state, VerificationState::Pending);
        }
    }

    #[tokio::test]
    async fn test_panicking_probe_resolves_to_failed() {
        let probe = ScriptedProbe::new(Duration::ZERO);
        probe.script("a.example", Script::Panic);
        let (orchestrator, ids) = engine(probe, &["a.example"]).await;

        let summary = orchestrator.verify_batch(&ids, None).await.unwrap();
        assert_eq!(summary.failed, 1);
        let proxy = orchestrator.store().get(ids[0]).await.unwrap();
        assert_eq!(proxy.state(), VerificationState::Failed);
        assert_eq!(proxy.health.last_failure, Some(FailureKind::Aborted));
        assert!(orchestrator.leases().is_empty());
    }

    #[tokio::test]
    async fn test_ip_log_written_only_on_change() {
        let probe = ScriptedProbe::new(Duration::ZERO);
        probe.script("a.example", Script::Ok(Some("203.0.113.1")));
        let (orchestrator, ids) = engine(probe.clone(), &["a.example"]).await;

        orchestrator.verify_proxy(ids[0]).await.unwrap();
        orchestrator.verify_proxy(ids[0]).await.unwrap();
        assert_eq!(orchestrator.logs().ip.len().await, 1);

        probe.script("a.example", Script::Ok(Some("203.0.113.2")));
        let proxy = orchestrator.verify_proxy(ids[0]).await.unwrap();
        assert_eq!(proxy.exit_ip.as_deref(), Some("203.0.113.2"));
        let page = orchestrator
            .logs()
            .ip
            .query(&LogQuery::for_proxy(ids[0]))
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].payload.previous_ip.as_deref(), Some("203.0.113.1"));
    }

    #[tokio::test]
    async fn test_restored_exit_ip_is_not_logged_as_change() {
        let probe = ScriptedProbe::new(Duration::ZERO);
        probe.script("a.example", Script::Ok(Some("203.0.113.1")));
        let mut saved = Proxy::new(ProxySpec::new("a.example", 8080).normalized().unwrap());
        saved.exit_ip = Some("203.0.113.1".to_string());
        let store = ProxyStore::new();
        store.restore(vec![saved.clone()]).await;
        let orchestrator = Orchestrator::new(store, LogRecorder::default(), SettingsStore::default(), probe);

        let proxy = orchestrator.verify_proxy(saved.id).await.unwrap();
        assert_eq!(proxy.exit_ip.as_deref(), Some("203.0.113.1"));
        assert!(orchestrator.logs().ip.is_empty().await);
    }

    #[tokio::test]
    async fn test_failures_accumulate_and_reset() {
        let probe = ScriptedProbe::new(Duration::ZERO);
        probe.script("a.example", Script::Timeout);
        let (orchestrator, ids) = engine(probe.clone(), &["a.example"]).await;

        for _ in 0..3 {
            orchestrator.verify_batch(&ids, None).await.unwrap();
        }
        assert_eq!(
            orchestrator.store().get(ids[0]).await.unwrap().health.consecutive_failures,
            3
        );
        probe.script("a.example", Script::Ok(None));
        let proxy = orchestrator.verify_proxy(ids[0]).await.unwrap();
        assert_eq!(proxy.health.consecutive_failures, 0);
        assert_eq!(proxy.state(), VerificationState::Verified);
    }

    #[tokio::test]
    async fn test_deleted_proxy_keeps_logs() {
        let (orchestrator, ids) = engine(ScriptedProbe::new(Duration::ZERO), &["a.example"]).await;
        orchestrator.verify_proxy(ids[0]).await.unwrap();
        orchestrator.store().delete(ids[0]).await.unwrap();

        let page = orchestrator
            .logs()
            .speed
            .query(&LogQuery::for_proxy(ids[0]))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_closed_recorder_fails_batch() {
        let (orchestrator, ids) = engine(ScriptedProbe::new(Duration::ZERO), &["a.example"]).await;
        orchestrator.logs().close();
        assert!(matches!(
            orchestrator.verify_batch(&ids, None).await,
            Err(Error::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribers_receive_results() {
        let (orchestrator, ids) = engine(ScriptedProbe::new(Duration::ZERO), &["a.example", "b.example"]).await;
        let mut events = orchestrator.subscribe();
        orchestrator.verify_batch(&ids, None).await.unwrap();

        let mut seen = HashSet::new();
        for _ in 0..2 {
            let result = events.recv().await.unwrap();
            assert!(result.success);
            seen.insert(result.proxy_id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_from_config_restores_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("state.json");
        let mut config = Config::default();
        config.storage.snapshot_path = Some(snapshot.to_string_lossy().to_string());

        let first = Orchestrator::from_config(&config).await.unwrap();
        assert!(first.store().is_empty().await);
        let proxy = first.store().create(ProxySpec::new("10.0.0.1", 8080)).await.unwrap();
        let sample = SpeedSample {
            latency_ms: 40,
            target_url: "http://echo.invalid/ip".to_string(),
        };
        first.logs().speed.append(proxy.id, sample).await.unwrap();
        Snapshot::capture(first.store(), first.settings(), first.logs())
            .await
            .save(&snapshot)
            .await
            .unwrap();

        let second = Orchestrator::from_config(&config).await.unwrap();
        assert_eq!(second.store().len().await, 1);
        assert_eq!(second.logs().speed.len().await, 1);
    }
}
