//! Telnet 解碼器
//!
//! 每條連線一個 `TelnetCodec`：吃進任意切分的原始位元組，剝除協定序列，
//! 產出以換行（或 GA/EOR）分隔的文字區塊，以及要寫回伺服器的協商回覆。
//!
//! 不完整的 IAC 序列會保留到下一次 `decode` 再處理，永遠不會混進文字。

use std::time::Duration;

use bytes::BytesMut;
use tracing::{trace, warn};

use super::protocol::{
    build_ttype_is, hex_dump, negotiate, Negotiation, TelnetCommand, TelnetOption, IAC,
    TTYPE_SEND,
};

/// 尚未分隔的文字片段，等待多久後強制送出
pub const PROMPT_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// 伺服器已用 GA/EOR 標示提示字元後的等待時間
pub const DELIMITED_PROMPT_FLUSH_DELAY: Duration = Duration::from_millis(1000);

/// 保留的未完成子協商上限，超過後改為略過到 `IAC SE`
const MAX_HELD_BYTES: usize = 16 * 1024;

/// 解碼過程中需要上層知道的協定事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetNotice {
    /// 伺服器切換遠端回顯
    Echo(bool),
    /// 第一次看到 GA/EOR
    PromptsDelimited,
    /// 協商表不認得的選項，原始序列交給 hook 處理
    Option { sequence: Vec<u8> },
}

/// 單次 `decode` 的結果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// 完整的文字區塊（以 `\n` 結尾，或被 GA/EOR 截斷）
    pub chunks: Vec<Vec<u8>>,
    /// 需要寫回 socket 的協商回覆
    pub replies: Vec<u8>,
    pub notices: Vec<TelnetNotice>,
}

impl Decoded {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.replies.is_empty() && self.notices.is_empty()
    }
}

/// 每條連線的 Telnet 協定狀態
#[derive(Debug)]
pub struct TelnetCodec {
    /// 尚未完整的 IAC 序列尾端
    raw: BytesMut,
    /// 已剝除協定、等待分隔符的文字
    pending: BytesMut,
    /// 正在略過一段過長的子協商
    discarding: bool,
    prompts_delimited: bool,
    remote_echo: bool,
    terminal_type: String,
    flush_delay: Duration,
    delimited_flush_delay: Duration,
}

impl TelnetCodec {
    pub fn new(terminal_type: impl Into<String>) -> Self {
        Self {
            raw: BytesMut::new(),
            pending: BytesMut::new(),
            discarding: false,
            prompts_delimited: false,
            remote_echo: false,
            terminal_type: terminal_type.into(),
            flush_delay: PROMPT_FLUSH_DELAY,
            delimited_flush_delay: DELIMITED_PROMPT_FLUSH_DELAY,
        }
    }

    /// 設定未分隔片段的強制送出時間
    pub fn with_flush_delays(mut self, undelimited: Duration, delimited: Duration) -> Self {
        self.flush_delay = undelimited;
        self.delimited_flush_delay = delimited;
        self
    }

    /// 伺服器是否曾送出 GA/EOR
    pub fn prompts_delimited(&self) -> bool {
        self.prompts_delimited
    }

    pub fn remote_echo(&self) -> bool {
        self.remote_echo
    }

    /// 是否有尚未分隔的文字
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// 目前適用的強制送出等待時間
    pub fn flush_delay(&self) -> Duration {
        if self.prompts_delimited {
            self.delimited_flush_delay
        } else {
            self.flush_delay
        }
    }

    /// 取出尚未分隔的文字（逾時強制送出時使用）
    pub fn take_pending(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().to_vec())
        }
    }

    /// 解碼一段從 socket 讀到的位元組
    pub fn decode(&mut self, input: &[u8]) -> Decoded {
        let mut out = Decoded::default();

        self.raw.extend_from_slice(input);
        let data = self.raw.split();

        let mut i = 0;
        if self.discarding {
            match find_subnegotiation_end(&data, 0) {
                Ok(end) => {
                    trace!("過長的子協商結束");
                    self.discarding = false;
                    i = end + 1;
                }
                Err(resume) => {
                    self.hold(&data[resume..]);
                    return out;
                }
            }
        }

        while i < data.len() {
            let b = data[i];
            if b != IAC {
                self.push_text(b, &mut out);
                i += 1;
                continue;
            }

            let Some(&cmd) = data.get(i + 1) else {
                self.hold(&data[i..]);
                break;
            };

            if cmd == IAC {
                // IAC IAC：資料中的 0xFF
                self.push_text(IAC, &mut out);
                i += 2;
                continue;
            }

            match TelnetCommand::from_byte(cmd) {
                Some(TelnetCommand::Nop) => i += 2,
                Some(TelnetCommand::GoAhead) | Some(TelnetCommand::EndOfRecord) => {
                    if !self.pending.is_empty() {
                        out.chunks.push(self.pending.split().to_vec());
                    }
                    if !self.prompts_delimited {
                        self.prompts_delimited = true;
                        out.notices.push(TelnetNotice::PromptsDelimited);
                    }
                    i += 2;
                }
                Some(command) if command.is_negotiation() => {
                    let Some(&option) = data.get(i + 2) else {
                        self.hold(&data[i..]);
                        break;
                    };
                    self.handle_negotiation(command, option, &mut out);
                    i += 3;
                }
                Some(TelnetCommand::Sb) => match find_subnegotiation_end(&data, i + 2) {
                    Ok(end) => {
                        self.handle_subnegotiation(&data[i..=end], &mut out);
                        i = end + 1;
                    }
                    Err(resume) if data.len() - i > MAX_HELD_BYTES => {
                        warn!(
                            "子協商超過 {} 位元組，略過到 IAC SE",
                            MAX_HELD_BYTES
                        );
                        self.discarding = true;
                        self.hold(&data[resume..]);
                        break;
                    }
                    Err(_) => {
                        self.hold(&data[i..]);
                        break;
                    }
                },
                _ => {
                    trace!("略過 Telnet 命令: {:02X}", cmd);
                    i += 2;
                }
            }
        }

        out
    }

    fn push_text(&mut self, b: u8, out: &mut Decoded) {
        match b {
            b'\r' | 0 => {}
            b'\n' => {
                self.pending.extend_from_slice(b"\n");
                out.chunks.push(self.pending.split().to_vec());
            }
            _ => self.pending.extend_from_slice(&[b]),
        }
    }

    fn hold(&mut self, tail: &[u8]) {
        self.raw.extend_from_slice(tail);
    }

    fn handle_negotiation(&mut self, command: TelnetCommand, option: u8, out: &mut Decoded) {
        trace!("收到協商: {}", hex_dump(&[IAC, command as u8, option]));
        match negotiate(command, TelnetOption::from_byte(option)) {
            Negotiation::Reply(reply) => out.replies.extend_from_slice(&reply),
            Negotiation::Echo { remote, reply } => {
                // 狀態沒變就不回覆，避免協商迴圈
                if remote != self.remote_echo {
                    self.remote_echo = remote;
                    out.replies.extend_from_slice(&reply);
                    out.notices.push(TelnetNotice::Echo(remote));
                }
            }
            Negotiation::Delegate => out.notices.push(TelnetNotice::Option {
                sequence: vec![IAC, command as u8, option],
            }),
        }
    }

    fn handle_subnegotiation(&mut self, sequence: &[u8], out: &mut Decoded) {
        trace!("收到子協商: {}", hex_dump(sequence));
        let is_ttype_send = sequence.len() >= 6
            && sequence[2] == TelnetOption::TerminalType.as_byte()
            && sequence[3] == TTYPE_SEND;
        if is_ttype_send {
            out.replies
                .extend_from_slice(&build_ttype_is(&self.terminal_type));
        } else {
            out.notices.push(TelnetNotice::Option {
                sequence: sequence.to_vec(),
            });
        }
    }
}

/// 從子協商內容的 `from` 位置往後找 `IAC SE`，回傳 SE 的索引；
/// 找不到時回傳尚未檢查的位置（可能是落單的 IAC）
fn find_subnegotiation_end(data: &[u8], from: usize) -> Result<usize, usize> {
    let mut j = from;
    while j + 1 < data.len() {
        if data[j] == IAC {
            if data[j + 1] == TelnetCommand::Se as u8 {
                return Ok(j + 1);
            }
            // IAC IAC 是資料，一起跳過
            j += 2;
        } else {
            j += 1;
        }
    }
    Err(j)
}
