//! 引擎事件
//!
//! 所有跨執行緒的互動都以 `Event` 送進引擎的佇列，由單一消費者依序執行。

use std::fmt;

use crate::ansi::StyledText;
use crate::hook::HookArgs;
use crate::telnet::codec::TelnetNotice;
use crate::telnet::client::CloseReason;

/// 連線編號，每次連線遞增，用來辨識過期的網路事件
pub type ConnId = u64;

/// 引擎佇列中的事件
#[derive(Debug, Clone)]
pub enum Event {
    /// 停止引擎
    Shutdown,
    /// 從連線解出的一段文字；`conn_id` 不是目前連線時丟棄
    MudData {
        session: String,
        conn_id: ConnId,
        bytes: Vec<u8>,
    },
    /// 使用者輸入，`internal` 為 true 時不觸發 `from_user_hook`
    UserInput {
        text: String,
        internal: bool,
        session: Option<String>,
    },
    /// 送往前端的訊息
    Output { message: Message },
    /// 立即廣播某個 hook
    Spam(HookArgs),
    /// session 操作請求
    Session(SessionCommand),
    /// 連線任務回報
    Net(NetEvent),
}

impl Event {
    /// 日誌用的簡短名稱
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Shutdown => "shutdown",
            Event::MudData { .. } => "mud_data",
            Event::UserInput { .. } => "user_input",
            Event::Output { .. } => "output",
            Event::Spam(_) => "spam",
            Event::Session(_) => "session",
            Event::Net(_) => "net",
        }
    }
}

/// session 操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Create { name: String },
    Connect { name: String, host: String, port: u16 },
    Disconnect { name: String },
    Remove { name: String },
    SetCurrent { name: String },
    SetCharset { name: String, label: String },
    Write { name: String, text: String },
    SetVariable { name: String, key: String, value: String },
    SetSnoop { name: String, on: bool },
}

/// 連線任務送回引擎的事件
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Connected {
        session: String,
        conn_id: ConnId,
    },
    ConnectFailed {
        session: String,
        conn_id: ConnId,
        reason: String,
    },
    Telnet {
        session: String,
        conn_id: ConnId,
        notice: TelnetNotice,
    },
    Closed {
        session: String,
        conn_id: ConnId,
        reason: CloseReason,
    },
}

impl NetEvent {
    pub fn session(&self) -> &str {
        match self {
            NetEvent::Connected { session, .. }
            | NetEvent::ConnectFailed { session, .. }
            | NetEvent::Telnet { session, .. }
            | NetEvent::Closed { session, .. } => session,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        match self {
            NetEvent::Connected { conn_id, .. }
            | NetEvent::ConnectFailed { conn_id, .. }
            | NetEvent::Telnet { conn_id, .. }
            | NetEvent::Closed { conn_id, .. } => *conn_id,
        }
    }
}

/// 訊息類型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// 伺服器送來的文字
    MudData,
    /// 系統狀態訊息
    Status,
    /// 錯誤
    Error,
}

/// 送往前端的訊息
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    /// 來源 session，系統訊息為 `None`
    pub session: Option<String>,
    /// 不含色碼的純文字
    pub text: String,
    /// 帶樣式的片段，串起來等於 `text`
    pub fragments: Vec<StyledText>,
}

impl Message {
    fn system(kind: MessageKind, session: Option<String>, text: &str) -> Self {
        let line = format!(">>> {}\n", text);
        Self {
            kind,
            session,
            fragments: vec![StyledText::plain(line.clone())],
            text: line,
        }
    }

    /// 一行狀態訊息
    pub fn status(session: Option<String>, text: impl AsRef<str>) -> Self {
        Self::system(MessageKind::Status, session, text.as_ref())
    }

    /// 一行錯誤訊息
    pub fn error(text: impl AsRef<str>) -> Self {
        Self::system(MessageKind::Error, None, text.as_ref())
    }

    /// 伺服器文字
    pub fn mud(session: impl Into<String>, fragments: Vec<StyledText>) -> Self {
        let text = fragments.iter().map(|f| f.text.as_str()).collect();
        Self {
            kind: MessageKind::MudData,
            session: Some(session.into()),
            text,
            fragments,
        }
    }

    /// 在每個片段前加上 `[name] ` 前綴（監看非目前 session 時使用）
    pub fn prefixed(mut self, prefix: &str) -> Self {
        self.text = format!("{}{}", prefix, self.text);
        self.fragments.insert(0, StyledText::plain(prefix));
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ansi::ColorState;

    #[test]
    fn test_status_message() {
        let msg = Message::status(Some("a".into()), "not connected");
        assert_eq!(msg.kind, MessageKind::Status);
        assert_eq!(msg.text, ">>> not connected\n");
        assert_eq!(msg.fragments, vec![StyledText::plain(">>> not connected\n")]);
    }

    #[test]
    fn test_mud_message_text_matches_fragments() {
        let bold = ColorState::DEFAULT.with_codes(&[1]);
        let msg = Message::mud(
            "a",
            vec![StyledText::plain("Hi "), StyledText::new(bold, "bold\n")],
        );
        assert_eq!(msg.text, "Hi bold\n");
        assert_eq!(msg.to_string(), "Hi bold\n");
    }

    #[test]
    fn test_prefixed() {
        let msg = Message::mud("b", vec![StyledText::plain("tick\n")]).prefixed("[b] ");
        assert_eq!(msg.text, "[b] tick\n");
        assert_eq!(msg.fragments[0], StyledText::plain("[b] "));
        assert_eq!(msg.fragments.len(), 2);
    }

    #[test]
    fn test_net_event_accessors() {
        let ev = NetEvent::Closed {
            session: "a".into(),
            conn_id: 3,
            reason: CloseReason::RemoteClosed,
        };
        assert_eq!(ev.session(), "a");
        assert_eq!(ev.conn_id(), 3);
        assert_eq!(Event::Net(ev).kind(), "net");
    }
}
