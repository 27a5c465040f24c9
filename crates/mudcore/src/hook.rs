//! Hook 註冊表
//!
//! 外部功能（alias、trigger、記錄器、前端）透過 hook 觀察並改寫流經引擎的資料，
//! 引擎本身不需要知道它們的存在。
//!
//! 每個 hook 對應一串 `(priority, callback)`，依 `(priority 遞增, 註冊順序)` 呼叫。
//! 只有在新增或移除之後才會重新排序。三種分派方式：
//!
//! - [`HookRegistry::broadcast`]：通知所有 callback，忽略回傳值
//! - [`HookRegistry::filter`]：依序改寫 `dataadj`，`Stop` 會中斷整條鏈
//! - [`HookRegistry::query`]：回傳第一個非空結果
//!
//! callback 回傳 `Err` 或 panic 時會被捕捉並記錄為 [`HookFailure`]，分派繼續進行。

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, trace, warn};

use crate::event::Message;

/// 最先執行
pub const PRIORITY_FIRST: i32 = 0;
/// 預設優先序，排在所有同優先序 callback 之後
pub const PRIORITY_LAST: i32 = 100;

/// Hook 錯誤
#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),

    #[error("未知的 hook: {0}")]
    UnknownHook(String),
}

impl HookError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// 已知的 hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    Startup,
    Shutdown,
    FromMud,
    MudFilter,
    FromUser,
    UserFilter,
    ToMud,
    ToUser,
    Timer,
    Connect,
    Disconnect,
    ErrorOccurred,
    TooManyErrors,
    TelnetOption,
    SessionChange,
    SessionCreated,
    SessionRemoved,
    Echo,
}

impl Hook {
    pub const ALL: [Hook; 18] = [
        Hook::Startup,
        Hook::Shutdown,
        Hook::FromMud,
        Hook::MudFilter,
        Hook::FromUser,
        Hook::UserFilter,
        Hook::ToMud,
        Hook::ToUser,
        Hook::Timer,
        Hook::Connect,
        Hook::Disconnect,
        Hook::ErrorOccurred,
        Hook::TooManyErrors,
        Hook::TelnetOption,
        Hook::SessionChange,
        Hook::SessionCreated,
        Hook::SessionRemoved,
        Hook::Echo,
    ];

    /// 對外公開的 hook 名稱
    pub fn name(&self) -> &'static str {
        match self {
            Hook::Startup => "startup_hook",
            Hook::Shutdown => "shutdown_hook",
            Hook::FromMud => "from_mud_hook",
            Hook::MudFilter => "mud_filter_hook",
            Hook::FromUser => "from_user_hook",
            Hook::UserFilter => "user_filter_hook",
            Hook::ToMud => "to_mud_hook",
            Hook::ToUser => "to_user_hook",
            Hook::Timer => "timer_hook",
            Hook::Connect => "connect_hook",
            Hook::Disconnect => "disconnect_hook",
            Hook::ErrorOccurred => "error_occurred_hook",
            Hook::TooManyErrors => "too_many_errors_hook",
            Hook::TelnetOption => "net_handle_telnet_option",
            Hook::SessionChange => "session_change_hook",
            Hook::SessionCreated => "session_created_hook",
            Hook::SessionRemoved => "session_removed_hook",
            Hook::Echo => "echo_hook",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Hook {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hook::ALL
            .iter()
            .copied()
            .find(|hook| hook.name() == s)
            .ok_or_else(|| HookError::UnknownHook(s.to_string()))
    }
}

/// 每個 hook 的參數
#[derive(Debug, Clone, PartialEq)]
pub enum HookArgs {
    Startup,
    Shutdown,
    FromMud {
        session: String,
        data: String,
    },
    MudFilter {
        session: String,
        data: String,
        dataadj: String,
    },
    FromUser {
        data: String,
    },
    UserFilter {
        session: String,
        internal: bool,
        verbatim: bool,
        data: String,
        dataadj: String,
    },
    ToMud {
        session: String,
        data: String,
        dataadj: String,
    },
    ToUser {
        message: Message,
    },
    Timer {
        tick: u64,
    },
    Connect {
        session: String,
        host: String,
        port: u16,
    },
    Disconnect {
        session: String,
        host: String,
        port: u16,
    },
    ErrorOccurred {
        count: u32,
    },
    TooManyErrors,
    TelnetOption {
        session: String,
        data: Vec<u8>,
    },
    SessionChange {
        old: String,
        new: String,
    },
    SessionCreated {
        session: String,
        template: String,
    },
    SessionRemoved {
        session: String,
    },
    Echo {
        session: String,
        remote: bool,
    },
}

impl HookArgs {
    /// 這組參數屬於哪個 hook
    pub fn hook(&self) -> Hook {
        match self {
            HookArgs::Startup => Hook::Startup,
            HookArgs::Shutdown => Hook::Shutdown,
            HookArgs::FromMud { .. } => Hook::FromMud,
            HookArgs::MudFilter { .. } => Hook::MudFilter,
            HookArgs::FromUser { .. } => Hook::FromUser,
            HookArgs::UserFilter { .. } => Hook::UserFilter,
            HookArgs::ToMud { .. } => Hook::ToMud,
            HookArgs::ToUser { .. } => Hook::ToUser,
            HookArgs::Timer { .. } => Hook::Timer,
            HookArgs::Connect { .. } => Hook::Connect,
            HookArgs::Disconnect { .. } => Hook::Disconnect,
            HookArgs::ErrorOccurred { .. } => Hook::ErrorOccurred,
            HookArgs::TooManyErrors => Hook::TooManyErrors,
            HookArgs::TelnetOption { .. } => Hook::TelnetOption,
            HookArgs::SessionChange { .. } => Hook::SessionChange,
            HookArgs::SessionCreated { .. } => Hook::SessionCreated,
            HookArgs::SessionRemoved { .. } => Hook::SessionRemoved,
            HookArgs::Echo { .. } => Hook::Echo,
        }
    }

    /// filter 類 hook 目前的 `dataadj`
    pub fn adjusted(&self) -> Option<&str> {
        match self {
            HookArgs::MudFilter { dataadj, .. }
            | HookArgs::UserFilter { dataadj, .. }
            | HookArgs::ToMud { dataadj, .. } => Some(dataadj),
            _ => None,
        }
    }

    /// 更新 `dataadj`；非 filter 類 hook 回傳 false
    pub fn set_adjusted(&mut self, value: String) -> bool {
        match self {
            HookArgs::MudFilter { dataadj, .. }
            | HookArgs::UserFilter { dataadj, .. }
            | HookArgs::ToMud { dataadj, .. } => {
                *dataadj = value;
                true
            }
            _ => false,
        }
    }
}

/// query 的結果值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl HookValue {
    pub fn is_empty(&self) -> bool {
        match self {
            HookValue::Text(s) => s.is_empty(),
            HookValue::Bytes(b) => b.is_empty(),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            HookValue::Text(s) => s,
            HookValue::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
        }
    }
}

/// callback 的回傳值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    /// 不改變任何東西
    Pass,
    /// 以新的值繼續（filter 中取代 `dataadj`）
    Continue(String),
    /// 吞掉資料並中斷整條鏈
    Stop,
    /// 立即以此值結束
    Done(HookValue),
}

pub type HookFn = Arc<dyn Fn(&HookArgs) -> Result<HookResult, HookError> + Send + Sync>;

/// 把閉包包成可註冊的 callback
pub fn hook_fn<F>(f: F) -> HookFn
where
    F: Fn(&HookArgs) -> Result<HookResult, HookError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 分派過程中失敗的 callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub hook: Hook,
    pub message: String,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.hook, self.message)
    }
}

struct HookEntry {
    priority: i32,
    seq: u64,
    callback: HookFn,
}

#[derive(Default)]
struct HookList {
    entries: Vec<HookEntry>,
    dirty: bool,
}

impl HookList {
    fn sorted(&mut self) -> &[HookEntry] {
        if self.dirty {
            self.entries.sort_by_key(|e| (e.priority, e.seq));
            self.dirty = false;
        }
        &self.entries
    }
}

/// Hook 註冊表
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<Hook, HookList>,
    next_seq: u64,
    failures: Vec<HookFailure>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以預設優先序註冊
    pub fn register(&mut self, hook: Hook, callback: HookFn) {
        self.register_with_priority(hook, callback, PRIORITY_LAST);
    }

    pub fn register_with_priority(&mut self, hook: Hook, callback: HookFn, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let list = self.hooks.entry(hook).or_default();
        list.entries.push(HookEntry {
            priority,
            seq,
            callback,
        });
        list.dirty = true;
        trace!("註冊 {} (priority {})", hook, priority);
    }

    /// 移除所有相同的 callback，回傳移除數量
    pub fn unregister(&mut self, hook: Hook, callback: &HookFn) -> usize {
        let Some(list) = self.hooks.get_mut(&hook) else {
            return 0;
        };
        let target = Arc::as_ptr(callback) as *const ();
        let before = list.entries.len();
        list.entries
            .retain(|e| Arc::as_ptr(&e.callback) as *const () != target);
        let removed = before - list.entries.len();
        if removed > 0 {
            list.dirty = true;
        }
        removed
    }

    /// 已註冊的 callback 數量
    pub fn count(&self, hook: Hook) -> usize {
        self.hooks.get(&hook).map_or(0, |l| l.entries.len())
    }

    /// 取出並清空分派過程中記錄的失敗
    pub fn take_failures(&mut self) -> Vec<HookFailure> {
        std::mem::take(&mut self.failures)
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// 廣播給所有 callback，回傳實際呼叫的數量
    pub fn broadcast(&mut self, args: &HookArgs) -> usize {
        self.broadcast_or(args, |_| {})
    }

    /// 廣播；沒有任何註冊者時改呼叫 `empty`
    pub fn broadcast_or(&mut self, args: &HookArgs, empty: impl FnOnce(&HookArgs)) -> usize {
        let hook = args.hook();
        let entries = match self.hooks.get_mut(&hook) {
            Some(list) if !list.entries.is_empty() => list.sorted(),
            _ => {
                empty(args);
                return 0;
            }
        };
        for entry in entries {
            invoke(hook, &entry.callback, args, &mut self.failures);
        }
        entries.len()
    }

    /// filter 鏈，結束時原樣回傳 `dataadj`
    pub fn filter(&mut self, args: HookArgs) -> Option<String> {
        self.filter_with(args, |adjusted| adjusted)
    }

    /// filter 鏈：每個 callback 看到前一個的 `dataadj`。
    ///
    /// `Stop` 讓結果為 `None`；`Done` 直接以其值為結果；正常走完則以 `done`
    /// 轉換最後的 `dataadj`。參數不是 filter 類 hook 時回傳 `None`。
    pub fn filter_with(
        &mut self,
        mut args: HookArgs,
        done: impl FnOnce(String) -> String,
    ) -> Option<String> {
        let hook = args.hook();
        if let Some(list) = self.hooks.get_mut(&hook) {
            for entry in list.sorted() {
                match invoke(hook, &entry.callback, &args, &mut self.failures) {
                    Some(HookResult::Continue(value)) => {
                        args.set_adjusted(value);
                    }
                    Some(HookResult::Stop) => {
                        trace!("{} 被中斷", hook);
                        return None;
                    }
                    Some(HookResult::Done(value)) => return Some(value.into_text()),
                    Some(HookResult::Pass) | None => {}
                }
            }
        }
        args.adjusted().map(|s| done(s.to_string()))
    }

    /// 依序詢問，回傳第一個非空結果
    pub fn query(&mut self, args: &HookArgs) -> Option<HookValue> {
        let hook = args.hook();
        let list = self.hooks.get_mut(&hook)?;
        for entry in list.sorted() {
            match invoke(hook, &entry.callback, args, &mut self.failures) {
                Some(HookResult::Continue(text)) if !text.is_empty() => {
                    return Some(HookValue::Text(text))
                }
                Some(HookResult::Done(value)) if !value.is_empty() => return Some(value),
                Some(HookResult::Stop) => return None,
                _ => {}
            }
        }
        None
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<_> = self
            .hooks
            .iter()
            .map(|(hook, list)| (*hook, list.entries.len()))
            .collect();
        counts.sort();
        f.debug_struct("HookRegistry")
            .field("hooks", &counts)
            .field("failures", &self.failures.len())
            .finish()
    }
}

/// 呼叫單一 callback，把錯誤與 panic 轉成失敗記錄
fn invoke(
    hook: Hook,
    callback: &HookFn,
    args: &HookArgs,
    failures: &mut Vec<HookFailure>,
) -> Option<HookResult> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(args))) {
        Ok(Ok(result)) => Some(result),
        Ok(Err(e)) => {
            warn!("{} callback 失敗: {}", hook, e);
            failures.push(HookFailure {
                hook,
                message: e.to_string(),
            });
            None
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("{} callback panic: {}", hook, message);
            failures.push(HookFailure {
                hook,
                message: format!("panic: {}", message),
            });
            None
        }
    }
}

/// 從 panic payload 取出訊息
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
