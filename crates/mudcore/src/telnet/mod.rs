//! Telnet 協定模組
//!
//! - `protocol`: 協定常數、選項協商表、送出前跳脫
//! - `codec`: 每條連線的解碼狀態機
//! - `client`: 非同步連線任務

pub mod client;
pub mod codec;
pub mod protocol;

pub use client::{CloseReason, Outbound, TelnetConfig, TelnetError};
pub use codec::{Decoded, TelnetCodec, TelnetNotice};
pub use protocol::{TelnetCommand, TelnetOption};
