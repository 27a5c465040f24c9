//! Telnet 連線任務
//!
//! 每條連線一個 tokio 任務，它只是事件的生產者：讀到的資料經 `TelnetCodec`
//! 處理後以 `Event` 送進引擎佇列，寫出的資料則從 `Outbound` channel 收取。
//! 任務本身不碰任何 session 狀態。

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

use super::codec::TelnetCodec;
use super::protocol::hex_dump;
use crate::config::NetConfig;
use crate::event::{ConnId, Event, NetEvent};

/// Telnet 客戶端錯誤
#[derive(Debug, Error)]
pub enum TelnetError {
    #[error("連線失敗: {0}")]
    ConnectionFailed(#[from] io::Error),

    #[error("連線逾時")]
    Timeout,

    #[error("DNS 解析失敗: {0}")]
    DnsResolutionFailed(String),
}

/// Telnet 客戶端配置
#[derive(Debug, Clone)]
pub struct TelnetConfig {
    /// 連線逾時
    pub connect_timeout: Duration,
    /// 讀取緩衝區大小
    pub read_buffer_size: usize,
    pub prompt_flush: Duration,
    pub delimited_prompt_flush: Duration,
    pub terminal_type: String,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self::from(&NetConfig::default())
    }
}

impl From<&NetConfig> for TelnetConfig {
    fn from(net: &NetConfig) -> Self {
        Self {
            connect_timeout: net.connect_timeout(),
            read_buffer_size: net.read_buffer_size.max(1),
            prompt_flush: net.prompt_flush(),
            delimited_prompt_flush: net.delimited_prompt_flush(),
            terminal_type: net.terminal_type.clone(),
        }
    }
}

impl TelnetConfig {
    /// 依設定建立新連線用的解碼器
    pub fn codec(&self) -> TelnetCodec {
        TelnetCodec::new(self.terminal_type.clone())
            .with_flush_delays(self.prompt_flush, self.delimited_prompt_flush)
    }
}

/// 引擎送給連線任務的指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// 已跳脫完成的位元組
    Data(Vec<u8>),
    /// 關閉連線
    Close,
}

/// 連線結束的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 伺服器關閉連線
    RemoteClosed,
    /// 本地要求斷線
    Local,
    /// 引擎停止
    Shutdown,
    /// 讀寫錯誤
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::RemoteClosed => f.write_str("伺服器已關閉連線"),
            CloseReason::Local => f.write_str("已斷開連線"),
            CloseReason::Shutdown => f.write_str("程式結束"),
            CloseReason::Error(e) => write!(f, "連線錯誤: {}", e),
        }
    }
}

/// 連線任務回報事件的對象
#[derive(Debug, Clone)]
pub struct Link {
    pub session: String,
    pub conn_id: ConnId,
    pub events: mpsc::UnboundedSender<Event>,
}

impl Link {
    /// 送出事件；引擎已停止時回傳 false
    fn send(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    fn net(&self, make: impl FnOnce(String, ConnId) -> NetEvent) -> bool {
        self.send(Event::Net(make(self.session.clone(), self.conn_id)))
    }

    fn mud_data(&self, bytes: Vec<u8>) -> bool {
        self.send(Event::MudData {
            session: self.session.clone(),
            conn_id: self.conn_id,
            bytes,
        })
    }
}

/// 連線到 MUD 伺服器
///
/// # Arguments
/// * `host` - 主機名稱或 IP
/// * `port` - 連接埠
pub async fn connect(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TelnetError> {
    info!("正在連線到 {}:{}", host, port);

    // 解析主機名稱
    let addr = format!("{}:{}", host, port);
    let socket_addrs: Vec<SocketAddr> = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| TelnetError::DnsResolutionFailed(e.to_string()))?
        .collect();

    let Some(first) = socket_addrs.first() else {
        return Err(TelnetError::DnsResolutionFailed(format!(
            "無法解析主機: {}",
            host
        )));
    };

    debug!("已解析到位址: {:?}", socket_addrs);

    let stream = timeout(connect_timeout, TcpStream::connect(first))
        .await
        .map_err(|_| TelnetError::Timeout)?
        .map_err(TelnetError::ConnectionFailed)?;

    stream.set_nodelay(true)?;

    info!("已連線到 {}:{}", host, port);
    Ok(stream)
}

/// 啟動一條連線的任務：連線成功送出 `Connected`，失敗送出 `ConnectFailed`，
/// 結束時必定送出 `Closed`
pub fn spawn_connection(
    link: Link,
    host: String,
    port: u16,
    config: TelnetConfig,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = match connect(&host, port, config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[{}] 連線 {}:{} 失敗: {}", link.session, host, port, e);
                link.net(|session, conn_id| NetEvent::ConnectFailed {
                    session,
                    conn_id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        if !link.net(|session, conn_id| NetEvent::Connected { session, conn_id }) {
            return;
        }

        let reason = run_stream(stream, &link, config.codec(), &config, outbound, shutdown).await;
        info!("[{}] 連線結束: {}", link.session, reason);
        link.net(|session, conn_id| NetEvent::Closed {
            session,
            conn_id,
            reason,
        });
    })
}

/// 連線的讀寫迴圈，回傳結束原因
///
/// 同時等待四件事：socket 讀取、引擎送來的寫出指令、未分隔片段的送出期限，
/// 以及停止訊號。讀寫錯誤只會結束迴圈，不會往上拋。
pub async fn run_stream<S>(
    stream: S,
    link: &Link,
    mut codec: TelnetCodec,
    config: &TelnetConfig,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if *shutdown.borrow() {
        return CloseReason::Shutdown;
    }

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];
    let mut flush_at: Option<Instant> = None;

    let reason = loop {
        let deadline = flush_at;
        let flush = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        // 停止訊號與寫出指令優先於讀取
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break CloseReason::Shutdown;
                }
            },
            msg = outbound.recv() => match msg {
                Some(Outbound::Data(bytes)) => {
                    trace!("[{}] 送出: {}", link.session, hex_dump(&bytes));
                    if let Err(e) = write_flush(&mut writer, &bytes).await {
                        break CloseReason::Error(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => break CloseReason::Local,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => break CloseReason::RemoteClosed,
                Ok(n) => {
                    trace!("[{}] 收到 {} 位元組: {}", link.session, n, hex_dump(&buf[..n]));
                    let decoded = codec.decode(&buf[..n]);

                    if !decoded.replies.is_empty() {
                        trace!("[{}] 協商回覆: {}", link.session, hex_dump(&decoded.replies));
                        if let Err(e) = write_flush(&mut writer, &decoded.replies).await {
                            break CloseReason::Error(e.to_string());
                        }
                    }

                    let mut engine_alive = true;
                    for notice in decoded.notices {
                        engine_alive &= link.net(|session, conn_id| NetEvent::Telnet {
                            session,
                            conn_id,
                            notice,
                        });
                    }
                    for chunk in decoded.chunks {
                        engine_alive &= link.mud_data(chunk);
                    }
                    if !engine_alive {
                        break CloseReason::Shutdown;
                    }

                    flush_at = if !codec.has_pending() {
                        None
                    } else {
                        flush_at.or_else(|| Some(Instant::now() + codec.flush_delay()))
                    };
                }
                Err(e) => break CloseReason::Error(e.to_string()),
            },
            _ = flush => {
                flush_at = None;
                if let Some(pending) = codec.take_pending() {
                    trace!("[{}] 逾時送出未分隔片段 ({} 位元組)", link.session, pending.len());
                    if !link.mud_data(pending) {
                        break CloseReason::Shutdown;
                    }
                }
            },
        }
    };

    // 已讀到但尚未分隔的文字仍然交出去
    if let Some(pending) = codec.take_pending() {
        link.mud_data(pending);
    }
    if let Err(e) = writer.shutdown().await {
        debug!("[{}] 關閉寫入端失敗: {}", link.session, e);
    }
    reason
}

async fn write_flush<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet::codec::TelnetNotice;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    fn link() -> (Link, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Link {
                session: "test".to_string(),
                conn_id: 1,
                events: tx,
            },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn mud_text(events: &[Event]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::MudData { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_config_default() {
        let config = TelnetConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.read_buffer_size, 8192);
        assert_eq!(config.prompt_flush, Duration::from_millis(100));
        assert_eq!(config.terminal_type, "mudcore");
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::RemoteClosed.to_string(), "伺服器已關閉連線");
        assert_eq!(
            CloseReason::Error("reset".into()).to_string(),
            "連線錯誤: reset"
        );
    }

    #[tokio::test]
    async fn test_read_lines_and_reply_to_negotiation() {
        let mock = Builder::new()
            .read(b"Hello\r\n")
            .read(&[0xFF, 0xFD, 0x18])
            .write(&[0xFF, 0xFB, 0x18])
            .read(b"World\r\n")
            .build();
        let (link, mut rx) = link();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let config = TelnetConfig::default();

        let reason = run_stream(mock, &link, config.codec(), &config, out_rx, stop_rx).await;

        assert_eq!(reason, CloseReason::RemoteClosed);
        let events = drain(&mut rx);
        assert_eq!(
            mud_text(&events),
            vec![b"Hello\n".to_vec(), b"World\n".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_unknown_option_reported() {
        let mock = Builder::new().read(&[0xFF, 0xFB, 0xC9]).build();
        let (link, mut rx) = link();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let config = TelnetConfig::default();

        run_stream(mock, &link, config.codec(), &config, out_rx, stop_rx).await;

        let events = drain(&mut rx);
        assert!(matches!(
            &events[..],
            [Event::Net(NetEvent::Telnet {
                conn_id: 1,
                notice: TelnetNotice::Option { sequence },
                ..
            })] if sequence == &vec![0xFF, 0xFB, 0xC9]
        ));
    }

    #[tokio::test]
    async fn test_outbound_written_then_local_close() {
        let mock = Builder::new().write(b"look\r\n").build();
        let (link, _rx) = link();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let config = TelnetConfig::default();

        out_tx.send(Outbound::Data(b"look\r\n".to_vec())).unwrap();
        out_tx.send(Outbound::Close).unwrap();

        let reason = run_stream(mock, &link, config.codec(), &config, out_rx, stop_rx).await;
        assert_eq!(reason, CloseReason::Local);
    }

    #[tokio::test]
    async fn test_prompt_flushed_after_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"Password: ").await.unwrap();
            // 保持連線直到客戶端關閉
            let mut sink = [0u8; 16];
            let _ = socket.read(&mut sink).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (link, mut rx) = link();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let config = TelnetConfig::default();

        let task = tokio::spawn(async move {
            run_stream(stream, &link, config.codec(), &config, out_rx, stop_rx).await
        });

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            Event::MudData { ref bytes, conn_id: 1, .. } if bytes == b"Password: "
        ));

        out_tx.send(Outbound::Close).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::Local);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 16];
            let _ = socket.read(&mut sink).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (link, _rx) = link();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = TelnetConfig::default();

        let task = tokio::spawn(async move {
            run_stream(stream, &link, config.codec(), &config, out_rx, stop_rx).await
        });
        stop_tx.send(true).unwrap();

        let reason = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::Shutdown);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_connection_reports_failure() {
        // 先綁定再釋放，取得一個沒人聽的連接埠
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (link, mut rx) = link();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);

        spawn_connection(
            link,
            "127.0.0.1".to_string(),
            port,
            TelnetConfig::default(),
            out_rx,
            stop_rx,
        )
        .await
        .unwrap();

        let events = drain(&mut rx);
        assert!(matches!(
            &events[..],
            [Event::Net(NetEvent::ConnectFailed { conn_id: 1, .. })]
        ));
    }
}
