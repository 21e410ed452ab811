//! 后台任务：每日计费与导入后的自动匹配
//!
//! 引擎本身不持有任何定时器，这里只持有引擎的 `Arc` 并按需触发。

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{AppError, AppResult};
use crate::models::{BillingStats, RetryStats};
use crate::service::{BillingEngine, MatchingEngine};

/// 先跑到期扣款，再跑失败重试
pub async fn run_daily_billing(
    engine: &BillingEngine,
    run_date: NaiveDate,
) -> AppResult<(BillingStats, RetryStats)> {
    let billing = engine.process_monthly_billing(run_date).await?;
    let retries = engine.process_payment_retries(run_date).await?;
    Ok((billing, retries))
}

/// key: billing-scheduler -> daily tick
///
/// 按 `interval` 检查一次；同一自然日只完整跑一次，失败时下个 tick 重跑。
pub fn spawn_billing(engine: Arc<BillingEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut last_completed: Option<NaiveDate> = None;
        loop {
            ticker.tick().await;
            let today = Utc::now().date_naive();
            if last_completed == Some(today) {
                continue;
            }

            match run_daily_billing(&engine, today).await {
                Ok((billing, retries)) => {
                    tracing::info!(
                        run_date = %today,
                        charged = billing.charged,
                        failed = billing.failed,
                        retried = retries.retried,
                        suspended = billing.suspended + retries.suspended,
                        "daily billing tick completed"
                    );
                    last_completed = Some(today);
                }
                Err(err) => {
                    tracing::warn!(run_date = %today, error = %err, "daily billing tick failed");
                }
            }
        }
    })
}

/// key: match-worker-handle -> enqueue interface
#[derive(Clone)]
pub struct MatchJobHandle {
    sender: Sender<i64>,
}

impl MatchJobHandle {
    /// 某组织的对账单导入完成，排队自动匹配
    pub async fn dispatch(&self, organization_id: i64) -> AppResult<()> {
        self.sender.send(organization_id).await.map_err(|err| {
            AppError::validation(format!("failed to enqueue match job: {err}"))
        })
    }
}

/// 启动导入触发的匹配 worker
///
/// 不同组织并行 (最多 `workers` 个)；同一组织正在匹配时到达的请求合并为一次重跑。
pub fn start_match_worker(engine: Arc<MatchingEngine>, workers: usize) -> MatchJobHandle {
    let (tx, mut rx) = channel::<i64>(256);
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    // organization_id -> 是否需要重跑
    let in_flight: Arc<DashMap<i64, bool>> = Arc::new(DashMap::new());

    tokio::spawn(async move {
        while let Some(organization_id) = rx.recv().await {
            if let Some(mut rerun) = in_flight.get_mut(&organization_id) {
                *rerun = true;
                tracing::debug!(organization_id, "match already running, rerun scheduled");
                continue;
            }
            in_flight.insert(organization_id, false);

            let engine = engine.clone();
            let permits = permits.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    in_flight.remove(&organization_id);
                    return;
                };
                loop {
                    match engine.match_all(organization_id).await {
                        Ok(stats) => tracing::info!(
                            organization_id,
                            matched = stats.matched,
                            ambiguous = stats.ambiguous,
                            "import-triggered match finished"
                        ),
                        Err(err) => tracing::error!(
                            organization_id,
                            error = %err,
                            "import-triggered match failed"
                        ),
                    }

                    if in_flight
                        .remove_if(&organization_id, |_, rerun| !*rerun)
                        .is_some()
                    {
                        break;
                    }
                    if let Some(mut rerun) = in_flight.get_mut(&organization_id) {
                        *rerun = false;
                    }
                }
            });
        }
    });

    MatchJobHandle { sender: tx }
}
