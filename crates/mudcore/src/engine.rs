//! 事件引擎
//!
//! `Engine` 擁有 session 表、hook 註冊表與唯一的事件佇列。所有狀態變更都在
//! 單一消費者（[`Engine::run`]）中依到達順序執行；連線任務、計時器與前端的
//! 輸入迴圈只是生產者，手上只有 [`EngineHandle`]。
//!
//! 事件執行失敗（回傳錯誤、panic 或 hook callback 失敗）會被計數並回報，
//! 超過門檻後廣播 `too_many_errors_hook` 與 `shutdown_hook` 並停止。

use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ansi::strip_ansi;
use crate::config::EngineConfig;
use crate::event::{ConnId, Event, Message, NetEvent, SessionCommand};
use crate::hook::{panic_message, HookArgs, HookRegistry, HookValue};
use crate::session::{
    ConnectionHandle, Session, SessionCollaborator, SessionError, SessionManager,
};
use crate::telnet::client::{spawn_connection, CloseReason, Link, TelnetConfig};
use crate::telnet::codec::TelnetNotice;
use crate::telnet::protocol::{hex_dump, refusal};
use crate::timer::spawn_ticker;

/// 引擎錯誤
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("錯誤次數過多 ({0})，引擎停止")]
    TooManyErrors(u32),

    #[error("事件 {kind} 執行時 panic: {message}")]
    EventPanicked { kind: &'static str, message: String },

    #[error("必須在 tokio runtime 中執行")]
    NoRuntime,
}

// ============================================================================
// EngineHandle
// ============================================================================

/// 生產者端：只能把事件送進佇列
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl EngineHandle {
    pub fn from_sender(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    /// 加入佇列；引擎已停止時事件直接丟棄
    pub fn enqueue(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            trace!("引擎已停止，丟棄事件 {}", e.0.kind());
        }
    }

    pub fn shutdown(&self) {
        self.enqueue(Event::Shutdown);
    }

    /// 要求引擎廣播一個 hook
    pub fn spam(&self, args: HookArgs) {
        self.enqueue(Event::Spam(args));
    }

    /// 使用者輸入，送往目前 session
    pub fn user_input(&self, text: impl Into<String>) {
        self.enqueue(Event::UserInput {
            text: text.into(),
            internal: false,
            session: None,
        });
    }

    /// 程式產生的輸入，不觸發 `from_user_hook`
    pub fn internal_input(&self, session: Option<String>, text: impl Into<String>) {
        self.enqueue(Event::UserInput {
            text: text.into(),
            internal: true,
            session,
        });
    }

    pub fn output(&self, message: Message) {
        self.enqueue(Event::Output { message });
    }

    pub fn session(&self, command: SessionCommand) {
        self.enqueue(Event::Session(command));
    }

    /// 引擎的佇列是否已關閉
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// 事件引擎
pub struct Engine {
    config: EngineConfig,
    hooks: HookRegistry,
    sessions: SessionManager,
    collaborators: Vec<Box<dyn SessionCollaborator>>,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    shutdown_tx: watch::Sender<bool>,
    started: bool,
    running: bool,
    stopped: bool,
    fatal: bool,
    processed: u64,
    errors: u32,
    last_error: Option<String>,
    next_conn_id: ConnId,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let sessions = SessionManager::new(Session::template(&config));
        Self {
            config,
            hooks: HookRegistry::new(),
            sessions,
            collaborators: Vec::new(),
            tx,
            rx,
            shutdown_tx,
            started: false,
            running: true,
            stopped: false,
            fatal: false,
            processed: 0,
            errors: 0,
            last_error: None,
            next_conn_id: 1,
        }
    }

    /// 取得生產者端
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::from_sender(self.tx.clone())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// 註冊 session 協作者，依註冊順序呼叫
    pub fn add_collaborator(&mut self, collaborator: Box<dyn SessionCollaborator>) {
        self.collaborators.push(collaborator);
    }

    /// 已執行的事件數
    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// 訂閱停止訊號
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// 啟動每秒計時器
    pub fn start_timer(&self) -> Result<JoinHandle<()>, EngineError> {
        tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        Ok(spawn_ticker(
            self.handle(),
            self.config.timer.clone(),
            self.shutdown_signal(),
        ))
    }

    /// 消費者迴圈：依序執行事件直到 `Shutdown`
    pub async fn run(&mut self) -> Result<(), EngineError> {
        self.startup();
        while self.running {
            let Some(event) = self.rx.recv().await else {
                break;
            };
            self.process(event);
        }
        self.finish()
    }

    /// 同步執行目前佇列中所有事件，不等待新事件
    pub fn run_pending(&mut self) -> Result<(), EngineError> {
        self.startup();
        while self.running {
            let Ok(event) = self.rx.try_recv() else {
                break;
            };
            self.process(event);
        }
        self.finish()
    }

    fn startup(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        info!("引擎啟動");
        self.hooks.broadcast(&HookArgs::Startup);
        self.report_hook_failures();
    }

    fn finish(&self) -> Result<(), EngineError> {
        if self.fatal {
            Err(EngineError::TooManyErrors(self.errors))
        } else {
            Ok(())
        }
    }

    /// 執行單一事件；任何失敗都在這裡被攔下
    fn process(&mut self, event: Event) {
        let kind = event.kind();
        trace!("執行事件 #{} ({})", self.processed + 1, kind);

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(event)));
        self.processed += 1;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(EngineError::Session(e))) => {
                debug!("session 操作失敗: {}", e);
                self.status(None, e.to_string());
            }
            Ok(Err(e)) => self.tally_error(e.to_string()),
            Err(payload) => {
                let e = EngineError::EventPanicked {
                    kind,
                    message: panic_message(payload.as_ref()),
                };
                self.tally_error(e.to_string());
            }
        }
        self.report_hook_failures();
    }

    fn execute(&mut self, event: Event) -> Result<(), EngineError> {
        match event {
            Event::Shutdown => {
                self.shutdown_now();
                Ok(())
            }
            Event::MudData {
                session,
                conn_id,
                bytes,
            } => {
                self.handle_mud_data(&session, conn_id, &bytes);
                Ok(())
            }
            Event::UserInput {
                text,
                internal,
                session,
            } => self.handle_user_input(text, internal, session),
            Event::Output { message } => {
                self.deliver(message);
                Ok(())
            }
            Event::Spam(args) => {
                self.hooks.broadcast(&args);
                Ok(())
            }
            Event::Session(command) => self.handle_command(command),
            Event::Net(net) => {
                self.handle_net(net);
                Ok(())
            }
        }
    }

    // ========================================================================
    // 錯誤處理
    // ========================================================================

    /// 回報事件執行期間的 hook callback 失敗
    fn report_hook_failures(&mut self) {
        for failure in self.hooks.take_failures() {
            self.tally_error(format!("hook {}", failure));
        }
    }

    /// 回報錯誤時又失敗的 callback 只記錄，不再計數
    fn discard_report_failures(&mut self) {
        for failure in self.hooks.take_failures() {
            warn!("回報錯誤時 hook 失敗，不計入: {}", failure);
        }
    }

    fn tally_error(&mut self, message: String) {
        if self.fatal {
            warn!("引擎已停止，忽略錯誤: {}", message);
            return;
        }

        self.errors += 1;
        error!("引擎錯誤 #{}: {}", self.errors, message);
        self.deliver(Message::error(format!("錯誤 #{}: {}", self.errors, message)));
        self.last_error = Some(message);
        self.hooks
            .broadcast(&HookArgs::ErrorOccurred { count: self.errors });
        self.discard_report_failures();

        if self.errors > self.config.error_threshold {
            self.fatal = true;
            error!("錯誤次數超過 {}，停止引擎", self.config.error_threshold);
            let last = self.last_error.clone().unwrap_or_default();
            self.deliver(Message::error(format!(
                "錯誤次數過多 ({})，即將結束。最後的錯誤: {}",
                self.errors, last
            )));
            self.hooks.broadcast(&HookArgs::TooManyErrors);
            self.shutdown_now();
            self.discard_report_failures();
        }
    }

    /// 停止引擎：關閉所有連線並廣播 `shutdown_hook`，只會執行一次
    fn shutdown_now(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("引擎停止中");

        let connected: Vec<String> = self
            .sessions
            .names()
            .into_iter()
            .filter(|name| {
                self.sessions
                    .get(name)
                    .is_some_and(|s| s.connection().is_some())
            })
            .map(str::to_string)
            .collect();
        for name in connected {
            self.close_link(&name, CloseReason::Shutdown);
        }

        self.hooks.broadcast(&HookArgs::Shutdown);
        self.shutdown_tx.send_replace(true);
        self.running = false;
    }

    // ========================================================================
    // 輸出
    // ========================================================================

    /// 交給前端（`to_user_hook`）
    fn deliver(&mut self, message: Message) {
        let args = HookArgs::ToUser { message };
        self.hooks.broadcast_or(&args, |args| {
            if let HookArgs::ToUser { message } = args {
                debug!("沒有輸出端: {}", message.text.trim_end());
            }
        });
    }

    fn status(&mut self, session: Option<&str>, text: impl AsRef<str>) {
        self.deliver(Message::status(session.map(str::to_string), text));
    }

    // ========================================================================
    // 資料流
    // ========================================================================

    fn handle_mud_data(&mut self, name: &str, conn_id: ConnId, bytes: &[u8]) {
        let Some(session) = self
            .sessions
            .get_mut(name)
            .filter(|s| s.owns_connection(conn_id))
        else {
            debug!("[{}] 連線 #{} 已過期，丟棄 {} 位元組", name, conn_id, bytes.len());
            return;
        };
        let text = session.decode(bytes);
        if text.is_empty() {
            return;
        }
        trace!("[{}] {}", name, strip_ansi(&text).trim_end());

        self.hooks.broadcast(&HookArgs::FromMud {
            session: name.to_string(),
            data: text.clone(),
        });
        let Some(adjusted) = self.hooks.filter(HookArgs::MudFilter {
            session: name.to_string(),
            data: text.clone(),
            dataadj: text,
        }) else {
            return;
        };
        if adjusted.is_empty() {
            return;
        }

        let is_current = self.sessions.current_name() == name;
        let Some(session) = self.sessions.get_mut(name) else {
            return;
        };
        let fragments = session.render(&adjusted);
        let snoop = session.snoop();
        if fragments.is_empty() {
            return;
        }

        let message = Message::mud(name, fragments);
        if is_current {
            self.deliver(message);
        } else if snoop {
            self.deliver(message.prefixed(&format!("[{}] ", name)));
        }
    }

    fn handle_user_input(
        &mut self,
        text: String,
        internal: bool,
        target: Option<String>,
    ) -> Result<(), EngineError> {
        let name = target.unwrap_or_else(|| self.sessions.current_name().to_string());
        let verbatim = self
            .sessions
            .get(&name)
            .ok_or_else(|| SessionError::NotFound(name.clone()))?
            .verbatim();

        if !internal {
            self.hooks.broadcast(&HookArgs::FromUser { data: text.clone() });
        }

        let Some(mut line) = self.hooks.filter(HookArgs::UserFilter {
            session: name.clone(),
            internal,
            verbatim,
            data: text.clone(),
            dataadj: text,
        }) else {
            return Ok(());
        };
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write(&name, &line)?;
        Ok(())
    }

    // ========================================================================
    // Session 操作（對外介面）
    // ========================================================================

    /// 目前 session 的名稱
    pub fn current_session(&self) -> &str {
        self.sessions.current_name()
    }

    pub fn session(&self, name: &str) -> Option<&Session> {
        self.sessions.get(name)
    }

    /// 切換目前 session，有變動時廣播 `session_change_hook`
    pub fn set_current(&mut self, name: &str) -> Result<(), SessionError> {
        let old = self.sessions.set_current(name)?;
        if old != name {
            info!("目前 session: {} -> {}", old, name);
            self.hooks.broadcast(&HookArgs::SessionChange {
                old,
                new: name.to_string(),
            });
        }
        Ok(())
    }

    /// 由範本建立新 session
    pub fn create_session(&mut self, name: &str) -> Result<(), SessionError> {
        self.sessions.create(name)?;
        let template = self.sessions.template_name().to_string();
        if let (Some(session), Some(tmpl)) = (self.sessions.get(name), self.sessions.get(&template))
        {
            for collaborator in &mut self.collaborators {
                collaborator.on_session_created(session, tmpl);
            }
        }
        info!("已建立 session {}", name);
        self.hooks.broadcast(&HookArgs::SessionCreated {
            session: name.to_string(),
            template,
        });
        Ok(())
    }

    /// 移除 session：先斷線，再通知所有協作者
    pub fn remove_session(&mut self, name: &str) -> Result<(), SessionError> {
        if name == self.sessions.template_name() {
            return Err(SessionError::TemplateNotRemovable(name.to_string()));
        }
        let session = self
            .sessions
            .get(name)
            .ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        if session.connection().is_some() {
            self.close_link(name, CloseReason::Local);
        }

        let was_current = self.sessions.current_name() == name;
        self.sessions.remove(name)?;
        for collaborator in &mut self.collaborators {
            collaborator.on_session_removed(name);
        }
        info!("已移除 session {}", name);
        self.hooks.broadcast(&HookArgs::SessionRemoved {
            session: name.to_string(),
        });
        if was_current {
            self.hooks.broadcast(&HookArgs::SessionChange {
                old: name.to_string(),
                new: self.sessions.current_name().to_string(),
            });
        }
        Ok(())
    }

    /// 為 session 開啟連線；結果稍後以 `NetEvent` 回報
    pub fn connect(&mut self, name: &str, host: &str, port: u16) -> Result<(), EngineError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::NoRuntime);
        }

        let conn_id = self.next_conn_id;
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .require_mut(name)?
            .attach(ConnectionHandle::new(conn_id, host, port, tx))?;
        self.next_conn_id += 1;

        let link = Link {
            session: name.to_string(),
            conn_id,
            events: self.tx.clone(),
        };
        spawn_connection(
            link,
            host.to_string(),
            port,
            TelnetConfig::from(&self.config.net),
            rx,
            self.shutdown_signal(),
        );
        self.status(Some(name), format!("正在連線到 {}:{}", host, port));
        Ok(())
    }

    /// 主動斷線
    pub fn disconnect(&mut self, name: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(name)
            .ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        if session.connection().is_none() {
            return Err(SessionError::NotConnected(name.to_string()));
        }
        self.close_link(name, CloseReason::Local);
        Ok(())
    }

    /// 送出文字：先經過 `to_mud_hook`，再編碼寫入連線
    pub fn write(&mut self, name: &str, text: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(name)
            .ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        if session.connection().is_none() {
            return Err(SessionError::NotConnected(name.to_string()));
        }

        let Some(adjusted) = self.hooks.filter(HookArgs::ToMud {
            session: name.to_string(),
            data: text.to_string(),
            dataadj: text.to_string(),
        }) else {
            return Ok(());
        };

        let session = self
            .sessions
            .get(name)
            .ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        let bytes = session.encode_outbound(&adjusted);
        match session.connection() {
            Some(conn) if conn.send(bytes) => Ok(()),
            _ => Err(SessionError::NotConnected(name.to_string())),
        }
    }

    /// 最後 `count` 行回捲內容
    pub fn scrollback(&self, name: &str, count: usize) -> Result<Vec<String>, SessionError> {
        let session = self
            .sessions
            .get(name)
            .ok_or_else(|| SessionError::NotFound(name.to_string()))?;
        Ok(session
            .scrollback()
            .last_n(count)
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// 卸下連線、要求任務關閉，並廣播 `disconnect_hook`
    fn close_link(&mut self, name: &str, reason: CloseReason) {
        let Some(handle) = self.sessions.get_mut(name).and_then(Session::detach) else {
            return;
        };
        handle.close();
        info!("[{}] 連線 #{} 關閉: {}", name, handle.id(), reason);
        if reason != CloseReason::Shutdown {
            self.status(Some(name), format!("{}: {}", name, reason));
        }
        self.hooks.broadcast(&HookArgs::Disconnect {
            session: name.to_string(),
            host: handle.host().to_string(),
            port: handle.port(),
        });
    }

    fn handle_command(&mut self, command: SessionCommand) -> Result<(), EngineError> {
        match command {
            SessionCommand::Create { name } => {
                self.create_session(&name)?;
                self.status(Some(&name), format!("已建立 session {}", name));
            }
            SessionCommand::Connect { name, host, port } => self.connect(&name, &host, port)?,
            SessionCommand::Disconnect { name } => self.disconnect(&name)?,
            SessionCommand::Remove { name } => {
                self.remove_session(&name)?;
                self.status(None, format!("已移除 session {}", name));
            }
            SessionCommand::SetCurrent { name } => self.set_current(&name)?,
            SessionCommand::Write { name, text } => self.write(&name, &text)?,
            SessionCommand::SetVariable { name, key, value } => {
                self.sessions.require_mut(&name)?.set_variable(key, value);
            }
            SessionCommand::SetSnoop { name, on } => {
                self.sessions.require_mut(&name)?.set_snoop(on);
                let state = if on { "開啟" } else { "關閉" };
                self.status(Some(&name), format!("{} 監看{}", name, state));
            }
            SessionCommand::SetCharset { name, label } => {
                let session = self.sessions.require_mut(&name)?;
                session.set_charset(&label);
                let charset = session.charset().name();
                self.status(Some(&name), format!("{} 編碼: {}", name, charset));
            }
        }
        Ok(())
    }

    // ========================================================================
    // 網路事件
    // ========================================================================

    fn handle_net(&mut self, net: NetEvent) {
        let name = net.session().to_string();
        let conn_id = net.conn_id();
        let owned = self
            .sessions
            .get(&name)
            .is_some_and(|s| s.owns_connection(conn_id));
        if !owned {
            debug!("忽略過期的連線事件 [{}] #{}", name, conn_id);
            return;
        }

        match net {
            NetEvent::Connected { .. } => {
                let Some(conn) = self
                    .sessions
                    .get_mut(&name)
                    .and_then(Session::connection_mut)
                else {
                    return;
                };
                conn.mark_connected();
                let (host, port) = (conn.host().to_string(), conn.port());
                info!("[{}] 已連線到 {}:{}", name, host, port);
                self.status(Some(&name), format!("已連線到 {}:{}", host, port));
                self.hooks.broadcast(&HookArgs::Connect {
                    session: name,
                    host,
                    port,
                });
            }
            NetEvent::ConnectFailed { reason, .. } => {
                if let Some(session) = self.sessions.get_mut(&name) {
                    session.detach();
                }
                self.status(Some(&name), format!("連線失敗: {}", reason));
            }
            NetEvent::Telnet { notice, .. } => self.handle_telnet_notice(&name, notice),
            NetEvent::Closed { reason, .. } => self.close_link(&name, reason),
        }
    }

    fn handle_telnet_notice(&mut self, name: &str, notice: TelnetNotice) {
        let Some(session) = self.sessions.get_mut(name) else {
            return;
        };
        match notice {
            TelnetNotice::Echo(remote) => {
                session.set_remote_echo(remote);
                self.hooks.broadcast(&HookArgs::Echo {
                    session: name.to_string(),
                    remote,
                });
            }
            TelnetNotice::PromptsDelimited => {
                debug!("[{}] 伺服器使用 GA/EOR 標示提示字元", name);
            }
            TelnetNotice::Option { sequence } => {
                let answer = self.hooks.query(&HookArgs::TelnetOption {
                    session: name.to_string(),
                    data: sequence.clone(),
                });
                let reply = match answer {
                    Some(HookValue::Bytes(bytes)) => Some(bytes),
                    Some(HookValue::Text(text)) => Some(text.into_bytes()),
                    None => refusal(&sequence),
                };
                let Some(reply) = reply else {
                    return;
                };
                debug!(
                    "[{}] 選項 {} 回覆 {}",
                    name,
                    hex_dump(&sequence),
                    hex_dump(&reply)
                );
                let sent = self
                    .sessions
                    .get(name)
                    .and_then(Session::connection)
                    .is_some_and(|conn| conn.send(reply));
                if !sent {
                    debug!("[{}] 連線已關閉，協商回覆未送出", name);
                }
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sessions", &self.sessions.names())
            .field("current", &self.sessions.current_name())
            .field("hooks", &self.hooks)
            .field("processed", &self.processed)
            .field("errors", &self.errors)
            .field("running", &self.running)
            .finish()
    }
}

// ============================================================================
// 測試
// ============================================================================
