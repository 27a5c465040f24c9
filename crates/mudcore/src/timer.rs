//! 每秒計時器
//!
//! 在每個整秒邊界送出一個 `timer_hook{tick}` 廣播事件。計時器只是生產者，
//! 透過事件佇列交給引擎，不會在其他 hook 執行中直接呼叫 hook。
//!
//! 落後（例如系統休眠後）超過 `max_lag_ticks` 秒時，依 [`CatchUp`] 決定補發多少次。

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::TimerConfig;
use crate::engine::EngineHandle;
use crate::hook::HookArgs;

/// 落後時的追趕策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUp {
    /// 以 `max_lag_ticks` 為單位整段略過，只補發最後不足一段的部分
    #[default]
    DropToWindow,
    /// 全部略過，只送出一次
    DropAll,
    /// 全部補發
    RunAll,
}

/// 一次喚醒要處理的 tick 數
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    /// 靜默略過（只推進計數）
    pub skipped: u64,
    /// 逐一送出
    pub emitted: u64,
}

/// 依落後的 tick 數決定略過與送出的數量
pub fn plan(lag: u64, max_lag: u64, policy: CatchUp) -> TickPlan {
    let max_lag = max_lag.max(1);
    if lag <= max_lag {
        return TickPlan {
            skipped: 0,
            emitted: lag,
        };
    }
    match policy {
        CatchUp::DropToWindow => {
            let skipped = ((lag - 1) / max_lag) * max_lag;
            TickPlan {
                skipped,
                emitted: lag - skipped,
            }
        }
        CatchUp::DropAll => TickPlan {
            skipped: lag - 1,
            emitted: 1,
        },
        CatchUp::RunAll => TickPlan {
            skipped: 0,
            emitted: lag,
        },
    }
}

/// 距離下一個整秒（牆上時鐘）的時間
fn until_next_second() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| Duration::from_nanos(u64::from(1_000_000_000 - d.subsec_nanos())))
        .unwrap_or(Duration::ZERO)
}

/// 啟動計時器任務，收到停止訊號或引擎關閉時結束
pub fn spawn_ticker(
    handle: EngineHandle,
    config: TimerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now() + until_next_second();
        let mut tick: u64 = 0;
        debug!("計時器啟動");

        loop {
            // 第 n 次 tick 的期限為 start + (n - 1) 秒
            let deadline = start + Duration::from_secs(tick);
            tokio::select! {
                _ = sleep_until(deadline) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let due = Instant::now().saturating_duration_since(start).as_secs() + 1;
            let lag = due.saturating_sub(tick).max(1);
            let step = plan(lag, config.max_lag_ticks, config.catch_up);
            if step.skipped > 0 {
                warn!("計時器落後 {} 秒，略過 {} 次", lag, step.skipped);
            }

            tick += step.skipped;
            for _ in 0..step.emitted {
                tick += 1;
                handle.spam(HookArgs::Timer { tick });
            }
            if handle.is_closed() {
                break;
            }
        }
        debug!("計時器停止 (tick {})", tick);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use tokio::sync::mpsc;

    #[test]
    fn test_plan_within_window() {
        for policy in [CatchUp::DropToWindow, CatchUp::DropAll, CatchUp::RunAll] {
            assert_eq!(plan(1, 10, policy), TickPlan { skipped: 0, emitted: 1 });
            assert_eq!(plan(10, 10, policy), TickPlan { skipped: 0, emitted: 10 });
        }
    }

    #[test]
    fn test_plan_drop_to_window() {
        assert_eq!(
            plan(11, 10, CatchUp::DropToWindow),
            TickPlan { skipped: 10, emitted: 1 }
        );
        assert_eq!(
            plan(20, 10, CatchUp::DropToWindow),
            TickPlan { skipped: 10, emitted: 10 }
        );
        assert_eq!(
            plan(37, 10, CatchUp::DropToWindow),
            TickPlan { skipped: 30, emitted: 7 }
        );
    }

    #[test]
    fn test_plan_drop_to_window_never_bursts_past_window() {
        for lag in 1..500 {
            let p = plan(lag, 10, CatchUp::DropToWindow);
            assert_eq!(p.skipped + p.emitted, lag);
            assert!(p.emitted >= 1 && p.emitted <= 10);
            assert_eq!(p.skipped % 10, 0);
        }
    }

    #[test]
    fn test_plan_other_policies() {
        assert_eq!(
            plan(37, 10, CatchUp::DropAll),
            TickPlan { skipped: 36, emitted: 1 }
        );
        assert_eq!(
            plan(37, 10, CatchUp::RunAll),
            TickPlan { skipped: 0, emitted: 37 }
        );
        // 0 視為 1
        assert_eq!(
            plan(3, 0, CatchUp::DropToWindow),
            TickPlan { skipped: 2, emitted: 1 }
        );
    }

    #[test]
    fn test_catch_up_serde_names() {
        assert_eq!(
            serde_json::to_string(&CatchUp::DropToWindow).unwrap(),
            "\"drop_to_window\""
        );
        let parsed: CatchUp = serde_json::from_str("\"run_all\"").unwrap();
        assert_eq!(parsed, CatchUp::RunAll);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_emits_increasing_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = spawn_ticker(
            EngineHandle::from_sender(tx),
            TimerConfig::default(),
            stop_rx,
        );

        for expected in 1..=3u64 {
            match rx.recv().await {
                Some(Event::Spam(HookArgs::Timer { tick })) => assert_eq!(tick, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
