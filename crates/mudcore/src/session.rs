//! Session 管理模組
//!
//! 每個 Session 代表一個到 MUD 伺服器的邏輯連線，擁有：
//! - 最多一條活躍連線（`ConnectionHandle`）
//! - 獨立的顏色狀態與回捲緩衝區
//! - session 範圍的變數與旗標
//!
//! 啟動時只有一個範本 session（預設名稱 `common`），它永遠不連線；
//! 其他 session 都由範本複製而來。任何時候都恰好有一個「目前」session。
//!
//! 這些狀態只由引擎的消費者存取，連線任務只拿得到 channel。

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::ansi::{ColorState, ColorTracker, StyledText};
use crate::buffer::Scrollback;
use crate::config::EngineConfig;
use crate::encoding::Charset;
use crate::event::ConnId;
use crate::telnet::client::Outbound;
use crate::telnet::protocol::escape_outbound;

/// Session 錯誤
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("找不到 session: {0}")]
    NotFound(String),

    #[error("session 已存在: {0}")]
    AlreadyExists(String),

    #[error("範本 session 不能移除: {0}")]
    TemplateNotRemovable(String),

    #[error("{0} 未連線 (not connected)")]
    NotConnected(String),

    #[error("{0} 是範本 session，不能連線")]
    IsTemplate(String),

    #[error("{0} 已經有連線")]
    AlreadyConnected(String),
}

// ============================================================================
// ConnectionHandle
// ============================================================================

/// 連線狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
}

/// 引擎持有的連線端點，透過 channel 把資料交給連線任務
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnId,
    host: String,
    port: u16,
    state: LinkState,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnId,
        host: impl Into<String>,
        port: u16,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            state: LinkState::Connecting,
            tx,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn mark_connected(&mut self) {
        self.state = LinkState::Connected;
    }

    /// 送出已編碼的資料；連線任務已結束時回傳 false
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(Outbound::Data(bytes)).is_ok()
    }

    /// 要求連線任務關閉 socket
    pub fn close(&self) {
        // 任務可能已經結束，忽略錯誤
        let _ = self.tx.send(Outbound::Close);
    }
}

// ============================================================================
// Session
// ============================================================================

/// Session 的生命週期狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Template,
    Connecting,
    Connected,
    Disconnected,
}

/// 單一 session
#[derive(Debug)]
pub struct Session {
    name: String,
    is_template: bool,
    connection: Option<ConnectionHandle>,
    color: ColorTracker,
    scrollback: Scrollback,
    variables: HashMap<String, String>,
    charset: Charset,
    snoop: bool,
    verbatim: bool,
    remote_echo: bool,
}

impl Session {
    /// 依設定建立範本 session
    pub fn template(config: &EngineConfig) -> Self {
        let template = &config.template;
        Self {
            name: template.name.clone(),
            is_template: true,
            connection: None,
            color: ColorTracker::new(),
            scrollback: Scrollback::new(config.scrollback_lines),
            variables: template.variables.clone(),
            charset: Charset::for_label(&template.charset),
            snoop: template.snoop,
            verbatim: template.verbatim,
            remote_echo: false,
        }
    }

    /// 由範本複製出新的 session：逐欄複製非連線狀態，顏色與回捲從頭開始
    pub fn clone_template(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_template: false,
            connection: None,
            color: ColorTracker::new(),
            scrollback: Scrollback::new(self.scrollback.capacity()),
            variables: self.variables.clone(),
            charset: self.charset.clone(),
            snoop: self.snoop,
            verbatim: self.verbatim,
            remote_echo: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_template(&self) -> bool {
        self.is_template
    }

    pub fn state(&self) -> SessionState {
        if self.is_template {
            return SessionState::Template;
        }
        match self.connection.as_ref().map(ConnectionHandle::state) {
            Some(LinkState::Connecting) => SessionState::Connecting,
            Some(LinkState::Connected) => SessionState::Connected,
            None => SessionState::Disconnected,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut ConnectionHandle> {
        self.connection.as_mut()
    }

    /// 目前的連線是否為 `conn_id`
    pub fn owns_connection(&self, conn_id: ConnId) -> bool {
        self.connection.as_ref().map(ConnectionHandle::id) == Some(conn_id)
    }

    /// 掛上新連線
    pub fn attach(&mut self, handle: ConnectionHandle) -> Result<(), SessionError> {
        if self.is_template {
            return Err(SessionError::IsTemplate(self.name.clone()));
        }
        if self.connection.is_some() {
            return Err(SessionError::AlreadyConnected(self.name.clone()));
        }
        debug!("[{}] 連線 #{} 建立中", self.name, handle.id());
        self.connection = Some(handle);
        Ok(())
    }

    /// 卸下連線，協定狀態一併重設
    pub fn detach(&mut self) -> Option<ConnectionHandle> {
        let handle = self.connection.take();
        if let Some(h) = &handle {
            debug!("[{}] 連線 #{} 已卸下", self.name, h.id());
            self.remote_echo = false;
            self.charset.reset();
        }
        handle
    }

    /// 用 session 的編碼解出文字
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.charset.decode(bytes)
    }

    /// 編碼並做 Telnet 跳脫，得到可直接寫入 socket 的位元組
    pub fn encode_outbound(&self, text: &str) -> Vec<u8> {
        escape_outbound(&self.charset.encode(text))
    }

    /// 追蹤顏色並寫入回捲，回傳帶樣式的片段
    pub fn render(&mut self, text: &str) -> Vec<StyledText> {
        let fragments = self.color.feed(text);
        for fragment in &fragments {
            self.scrollback.push_text(&fragment.text);
        }
        trace!("[{}] 輸出 {} 個片段", self.name, fragments.len());
        fragments
    }

    pub fn color_state(&self) -> ColorState {
        self.color.state()
    }

    pub fn scrollback(&self) -> &Scrollback {
        &self.scrollback
    }

    pub fn variable(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn charset(&self) -> &Charset {
        &self.charset
    }

    pub fn set_charset(&mut self, label: &str) {
        self.charset = Charset::for_label(label);
    }

    pub fn snoop(&self) -> bool {
        self.snoop
    }

    pub fn set_snoop(&mut self, on: bool) {
        self.snoop = on;
    }

    pub fn verbatim(&self) -> bool {
        self.verbatim
    }

    pub fn set_verbatim(&mut self, on: bool) {
        self.verbatim = on;
    }

    pub fn remote_echo(&self) -> bool {
        self.remote_echo
    }

    pub fn set_remote_echo(&mut self, on: bool) {
        self.remote_echo = on;
    }
}

// ============================================================================
// SessionCollaborator
// ============================================================================

/// 以 session 為索引保存資料的外部元件（alias、trigger、記錄器等）
///
/// 由引擎在消費者上依註冊順序呼叫
pub trait SessionCollaborator: Send {
    /// 新 session 由範本複製完成後
    fn on_session_created(&mut self, session: &Session, template: &Session);

    /// session 從表中移除後，應釋放所有與它有關的資料
    fn on_session_removed(&mut self, name: &str);
}

// ============================================================================
// SessionManager
// ============================================================================

/// Session 表
#[derive(Debug)]
pub struct SessionManager {
    sessions: BTreeMap<String, Session>,
    template: String,
    current: String,
}

impl SessionManager {
    /// 以範本 session 建立，範本同時是初始的目前 session
    pub fn new(template: Session) -> Self {
        let name = template.name().to_string();
        let mut sessions = BTreeMap::new();
        sessions.insert(name.clone(), template);
        Self {
            sessions,
            template: name.clone(),
            current: name,
        }
    }

    pub fn template_name(&self) -> &str {
        &self.template
    }

    pub fn current_name(&self) -> &str {
        &self.current
    }

    pub fn current(&self) -> Option<&Session> {
        self.sessions.get(&self.current)
    }

    pub fn get(&self, name: &str) -> Option<&Session> {
        self.sessions.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Session> {
        self.sessions.get_mut(name)
    }

    /// 依名稱取得，找不到時回傳錯誤
    pub fn require_mut(&mut self, name: &str) -> Result<&mut Session, SessionError> {
        self.sessions
            .get_mut(name)
            .ok_or_else(|| SessionError::NotFound(name.to_string()))
    }

    /// 從範本複製出新 session
    pub fn create(&mut self, name: &str) -> Result<&Session, SessionError> {
        if self.sessions.contains_key(name) {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }
        let template = self
            .sessions
            .get(&self.template)
            .ok_or_else(|| SessionError::NotFound(self.template.clone()))?;
        let session = template.clone_template(name);
        debug!("建立 session {}", name);
        Ok(self.sessions.entry(name.to_string()).or_insert(session))
    }

    /// 移除 session；若它是目前 session，改回範本
    pub fn remove(&mut self, name: &str) -> Result<Session, SessionError> {
        if name == self.template {
            return Err(SessionError::TemplateNotRemovable(name.to_string()));
        }
        let session = self
            .sessions
            .remove(name)
            .ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        if self.current == name {
            self.current = self.template.clone();
        }
        debug!("移除 session {}", name);
        Ok(session)
    }

    /// 切換目前 session，回傳原本的名稱
    pub fn set_current(&mut self, name: &str) -> Result<String, SessionError> {
        if !self.sessions.contains_key(name) {
            return Err(SessionError::NotFound(name.to_string()));
        }
        Ok(std::mem::replace(&mut self.current, name.to_string()))
    }

    /// 所有 session 名稱（依字母排序）
    pub fn names(&self) -> Vec<&str> {
        self.sessions.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ============================================================================
// 測試
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        let mut config = EngineConfig::default();
        config.scrollback_lines = 50;
        config.template.charset = "big5".to_string();
        config.template.snoop = true;
        config
            .template
            .variables
            .insert("char".to_string(), "hero".to_string());
        SessionManager::new(Session::template(&config))
    }

    fn handle(id: ConnId) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(id, "localhost", 4000, tx), rx)
    }

    #[test]
    fn test_template_is_initial_current() {
        let manager = manager();
        assert_eq!(manager.current_name(), "common");
        assert_eq!(manager.template_name(), "common");
        let current = manager.current().unwrap();
        assert!(current.is_template());
        assert_eq!(current.state(), SessionState::Template);
    }

    #[test]
    fn test_create_clones_template_state() {
        let mut manager = manager();
        let session = manager.create("a").unwrap();
        assert_eq!(session.name(), "a");
        assert!(!session.is_template());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.variable("char"), Some("hero"));
        assert_eq!(session.charset().name(), "Big5");
        assert!(session.snoop());
        assert_eq!(session.scrollback().capacity(), 50);

        assert_eq!(
            manager.create("a").unwrap_err(),
            SessionError::AlreadyExists("a".into())
        );
        assert_eq!(manager.names(), vec!["a", "common"]);
    }

    #[test]
    fn test_clone_does_not_share_variables() {
        let mut manager = manager();
        manager.create("a").unwrap();
        manager
            .get_mut("a")
            .unwrap()
            .set_variable("char", "villain");
        manager.create("b").unwrap();
        assert_eq!(manager.get("b").unwrap().variable("char"), Some("hero"));
    }

    #[test]
    fn test_remove_rules() {
        let mut manager = manager();
        assert_eq!(
            manager.remove("common").unwrap_err(),
            SessionError::TemplateNotRemovable("common".into())
        );
        assert_eq!(
            manager.remove("ghost").unwrap_err(),
            SessionError::NotFound("ghost".into())
        );

        manager.create("a").unwrap();
        assert_eq!(manager.set_current("a").unwrap(), "common");
        let removed = manager.remove("a").unwrap();
        assert_eq!(removed.name(), "a");
        assert_eq!(manager.current_name(), "common");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_set_current_unknown() {
        let mut manager = manager();
        assert!(manager.set_current("nope").is_err());
        assert_eq!(manager.current_name(), "common");
    }

    #[test]
    fn test_attach_and_detach() {
        let mut manager = manager();
        manager.create("a").unwrap();
        let session = manager.require_mut("a").unwrap();

        let (h, _rx) = handle(7);
        session.attach(h).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.owns_connection(7));
        assert!(!session.owns_connection(8));

        let (h2, _rx2) = handle(8);
        assert_eq!(
            session.attach(h2).unwrap_err(),
            SessionError::AlreadyConnected("a".into())
        );

        session.connection_mut().unwrap().mark_connected();
        assert_eq!(session.state(), SessionState::Connected);

        session.set_remote_echo(true);
        let detached = session.detach().unwrap();
        assert_eq!(detached.id(), 7);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.remote_echo());
    }

    #[test]
    fn test_template_cannot_attach() {
        let mut manager = manager();
        let template = manager.require_mut("common").unwrap();
        let (h, _rx) = handle(1);
        assert_eq!(
            template.attach(h).unwrap_err(),
            SessionError::IsTemplate("common".into())
        );
    }

    #[test]
    fn test_connection_handle_send_and_close() {
        let (h, mut rx) = handle(1);
        assert!(h.send(b"hi\r\n".to_vec()));
        h.close();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Data(b"hi\r\n".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        drop(rx);
        assert!(!h.send(b"late".to_vec()));
    }

    #[test]
    fn test_render_tracks_color_and_scrollback() {
        let mut manager = manager();
        manager.create("a").unwrap();
        let session = manager.require_mut("a").unwrap();

        let fragments = session.render("Hi \x1b[1;37mbold");
        assert_eq!(fragments.len(), 2);
        assert!(session.color_state().bold());

        session.render(" still\x1b[0m\n");
        assert!(session.color_state().is_default());
        assert_eq!(session.scrollback().last_n(1), vec!["Hi bold still"]);
    }

    #[test]
    fn test_encode_outbound_uses_charset() {
        let mut manager = manager();
        manager.create("a").unwrap();
        let session = manager.get("a").unwrap();
        assert_eq!(
            session.encode_outbound("你好\n"),
            vec![0xa7, 0x41, 0xa6, 0x6e, b'\r', b'\n']
        );
    }

    #[test]
    fn test_decode_uses_charset() {
        let mut manager = manager();
        manager.create("a").unwrap();
        let session = manager.require_mut("a").unwrap();
        assert_eq!(session.decode(&[0xa7]), "");
        assert_eq!(session.decode(&[0x41, b'\n']), "你\n");
    }

    #[test]
    fn test_detach_drops_partial_character() {
        let mut manager = manager();
        manager.create("a").unwrap();
        let session = manager.require_mut("a").unwrap();
        let (h, _rx) = handle(1);
        session.attach(h).unwrap();
        assert_eq!(session.decode(&[0xa7]), "");
        session.detach();

        let (h, _rx) = handle(2);
        session.attach(h).unwrap();
        assert_eq!(session.decode(b"ok\n"), "ok\n");
    }

    #[test]
    fn test_set_charset() {
        let mut manager = manager();
        manager.create("a").unwrap();
        let session = manager.require_mut("a").unwrap();
        session.set_charset("utf-8");
        assert_eq!(session.charset().name(), "UTF-8");
        assert_eq!(session.decode("你\n".as_bytes()), "你\n");
    }
}
