//! Session 編碼
//!
//! 每個 session 用自己的編碼解讀伺服器文字（預設 UTF-8，台灣 MUD 常用 Big5）。
//! 解碼器會保留跨讀取切開的多位元組字元，不會產生亂碼。

use std::fmt;

use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};
use tracing::warn;

/// 有狀態的編解碼器
pub struct Charset {
    encoding: &'static Encoding,
    decoder: Decoder,
}

impl Charset {
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            encoding,
            decoder: encoding.new_decoder_without_bom_handling(),
        }
    }

    /// 依名稱建立，不認得的名稱退回 UTF-8
    ///
    /// # Example
    /// ```
    /// use mudcore::encoding::Charset;
    ///
    /// assert_eq!(Charset::for_label("big5").name(), "Big5");
    /// assert_eq!(Charset::for_label("no-such-charset").name(), "UTF-8");
    /// ```
    pub fn for_label(label: &str) -> Self {
        match Encoding::for_label(label.trim().as_bytes()) {
            Some(encoding) => Self::new(encoding),
            None => {
                warn!("未知的編碼 {}，改用 UTF-8", label);
                Self::new(UTF_8)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// 解碼一段位元組；結尾不完整的字元留到下次
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut out = String::new();
        let mut src = bytes;
        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length(src.len())
                .unwrap_or(src.len() * 3 + 16);
            out.reserve(needed);
            let (result, read, _) = self.decoder.decode_to_string(src, &mut out, false);
            src = &src[read..];
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => continue,
            }
        }
        out
    }

    /// 丟棄解碼器中未完成的字元
    pub fn reset(&mut self) {
        self.decoder = self.encoding.new_decoder_without_bom_handling();
    }

    /// 把文字編碼成送往伺服器的位元組（無法編碼的字元會被替換）
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let (encoded, _, _) = self.encoding.encode(text);
        encoded.into_owned()
    }
}

impl Default for Charset {
    fn default() -> Self {
        Self::new(UTF_8)
    }
}

/// 複製時解碼器狀態重新開始
impl Clone for Charset {
    fn clone(&self) -> Self {
        Self::new(self.encoding)
    }
}

impl fmt::Debug for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Charset").field(&self.name()).finish()
    }
}
