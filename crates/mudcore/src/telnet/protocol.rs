//! Telnet 協定常數和選項協商表
//!
//! 實作 RFC 854 Telnet 協定的基本命令，以及本客戶端認得的少數選項

/// Telnet IAC (Interpret As Command) - 0xFF
pub const IAC: u8 = 255;

/// TERMTYPE 子協商：IS
pub const TTYPE_IS: u8 = 0;
/// TERMTYPE 子協商：SEND
pub const TTYPE_SEND: u8 = 1;

/// Telnet 命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TelnetCommand {
    /// End of Record
    EndOfRecord = 239,
    /// Sub-negotiation End
    Se = 240,
    /// No Operation
    Nop = 241,
    /// Data Mark
    DataMark = 242,
    /// Break
    Break = 243,
    /// Interrupt Process
    InterruptProcess = 244,
    /// Abort Output
    AbortOutput = 245,
    /// Are You There
    AreYouThere = 246,
    /// Erase Character
    EraseCharacter = 247,
    /// Erase Line
    EraseLine = 248,
    /// Go Ahead
    GoAhead = 249,
    /// Sub-negotiation Begin
    Sb = 250,
    /// Will
    Will = 251,
    /// Won't
    Wont = 252,
    /// Do
    Do = 253,
    /// Don't
    Dont = 254,
}

impl TelnetCommand {
    /// 從位元組解析 Telnet 命令
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            239 => Some(Self::EndOfRecord),
            240 => Some(Self::Se),
            241 => Some(Self::Nop),
            242 => Some(Self::DataMark),
            243 => Some(Self::Break),
            244 => Some(Self::InterruptProcess),
            245 => Some(Self::AbortOutput),
            246 => Some(Self::AreYouThere),
            247 => Some(Self::EraseCharacter),
            248 => Some(Self::EraseLine),
            249 => Some(Self::GoAhead),
            250 => Some(Self::Sb),
            251 => Some(Self::Will),
            252 => Some(Self::Wont),
            253 => Some(Self::Do),
            254 => Some(Self::Dont),
            _ => None,
        }
    }

    /// 是否為 WILL/WONT/DO/DONT 其中之一
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Self::Will | Self::Wont | Self::Do | Self::Dont)
    }
}

/// Telnet 選項
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetOption {
    /// Echo
    Echo,
    /// Suppress Go Ahead
    SuppressGoAhead,
    /// Terminal Type
    TerminalType,
    /// End of Record
    EndOfRecord,
    /// 其他選項，交由 hook 決定
    Unknown(u8),
}

impl TelnetOption {
    /// 從位元組解析 Telnet 選項
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Echo,
            3 => Self::SuppressGoAhead,
            24 => Self::TerminalType,
            25 => Self::EndOfRecord,
            other => Self::Unknown(other),
        }
    }

    /// 獲取選項的位元組值
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Echo => 1,
            Self::SuppressGoAhead => 3,
            Self::TerminalType => 24,
            Self::EndOfRecord => 25,
            Self::Unknown(b) => *b,
        }
    }
}

/// 協商表查詢結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// 已知選項，直接回覆
    Reply(Vec<u8>),
    /// 伺服器切換遠端回顯
    Echo { remote: bool, reply: Vec<u8> },
    /// 未知選項，交給上層
    Delegate,
}

fn reply(cmd: TelnetCommand, option: TelnetOption) -> Vec<u8> {
    vec![IAC, cmd as u8, option.as_byte()]
}

/// 查詢協商表：已知選項回傳回覆內容，其餘交由上層處理
pub fn negotiate(cmd: TelnetCommand, option: TelnetOption) -> Negotiation {
    use TelnetCommand::{Do, Dont, Will, Wont};
    use TelnetOption::{Echo, EndOfRecord, SuppressGoAhead, TerminalType};

    match (cmd, option) {
        (Will, Echo) => Negotiation::Echo {
            remote: true,
            reply: reply(Do, Echo),
        },
        (Wont, Echo) => Negotiation::Echo {
            remote: false,
            reply: reply(Dont, Echo),
        },
        (Will, SuppressGoAhead) => Negotiation::Reply(reply(Do, SuppressGoAhead)),
        (Will, EndOfRecord) => Negotiation::Reply(reply(Do, EndOfRecord)),
        (Wont, EndOfRecord) => Negotiation::Reply(reply(Dont, EndOfRecord)),
        (Do, TerminalType) => Negotiation::Reply(reply(Will, TerminalType)),
        (Dont, TerminalType) => Negotiation::Reply(reply(Wont, TerminalType)),
        _ => Negotiation::Delegate,
    }
}

/// 沒有 hook 處理時的預設回應：DO → WONT、WILL → DONT，WONT/DONT 不需回應
pub fn refusal(sequence: &[u8]) -> Option<Vec<u8>> {
    match sequence {
        [IAC, cmd, option] => match TelnetCommand::from_byte(*cmd)? {
            TelnetCommand::Do => Some(vec![IAC, TelnetCommand::Wont as u8, *option]),
            TelnetCommand::Will => Some(vec![IAC, TelnetCommand::Dont as u8, *option]),
            _ => None,
        },
        _ => None,
    }
}

/// 組出 `IAC SB TERMTYPE IS <name> IAC SE`
pub fn build_ttype_is(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + name.len());
    buf.extend_from_slice(&[
        IAC,
        TelnetCommand::Sb as u8,
        TelnetOption::TerminalType.as_byte(),
        TTYPE_IS,
    ]);
    for &b in name.as_bytes() {
        if b == IAC {
            buf.push(IAC);
        }
        buf.push(b);
    }
    buf.extend_from_slice(&[IAC, TelnetCommand::Se as u8]);
    buf
}

/// 送出前的 Telnet 跳脫：`\n` 改為 `\r\n`，資料中的 IAC 重複一次
pub fn escape_outbound(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 2);
    for &b in data {
        match b {
            b'\n' => out.extend_from_slice(b"\r\n"),
            IAC => out.extend_from_slice(&[IAC, IAC]),
            _ => out.push(b),
        }
    }
    out
}

/// 以十六進位格式輸出位元組，用於 trace 日誌
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
