//! MUD Core Library
//!
//! 多 session MUD 客戶端的執行核心：
//! - `engine`: 單一消費者的事件佇列與錯誤計數
//! - `hook`: 具優先序的 hook 註冊表（廣播、filter 鏈、查詢）
//! - `telnet`: Telnet 協定解碼與連線任務
//! - `ansi`: SGR 顏色狀態追蹤
//! - `session`: session 生命週期與範本
//! - `timer`: 每秒計時器
//! - `encoding`: 各 session 的字元編碼
//! - `buffer`: 回捲緩衝區
//! - `config`: 引擎設定檔

pub mod ansi;
pub mod buffer;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod event;
pub mod hook;
pub mod session;
pub mod telnet;
pub mod timer;

pub use ansi::{strip_ansi, ColorState, ColorTracker, StyledText};
pub use buffer::Scrollback;
pub use config::{ConfigError, EngineConfig, NetConfig, TemplateConfig, TimerConfig};
pub use encoding::Charset;
pub use engine::{Engine, EngineError, EngineHandle};
pub use event::{ConnId, Event, Message, MessageKind, NetEvent, SessionCommand};
pub use hook::{
    hook_fn, Hook, HookArgs, HookError, HookFn, HookRegistry, HookResult, HookValue,
    PRIORITY_FIRST, PRIORITY_LAST,
};
pub use session::{Session, SessionCollaborator, SessionError, SessionManager, SessionState};
pub use telnet::{TelnetCodec, TelnetError};
pub use timer::CatchUp;
