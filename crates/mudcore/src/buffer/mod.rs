//! 回捲緩衝區
//!
//! 每個 session 保留固定行數的輸出歷史，滿了就移除最舊的一行

use std::collections::VecDeque;

/// 預設保留行數
pub const DEFAULT_SCROLLBACK_LINES: usize = 10_000;

/// 回捲緩衝區
///
/// 文字以行為單位存放；尚未遇到換行的尾段另外保留，等下一段文字補齊
#[derive(Debug, Clone)]
pub struct Scrollback {
    lines: VecDeque<String>,
    partial: String,
    capacity: usize,
}

impl Scrollback {
    /// 創建新的回捲緩衝區
    ///
    /// # Example
    /// ```
    /// use mudcore::buffer::Scrollback;
    ///
    /// let mut buffer = Scrollback::new(2);
    /// buffer.push_text("a\nb\nc\n");
    /// assert_eq!(buffer.last_n(5), vec!["b", "c"]);
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            partial: String::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 加入一段文字，可能包含多行或不完整的一行
    pub fn push_text(&mut self, text: &str) {
        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            let mut line = std::mem::take(&mut self.partial);
            line.push_str(&rest[..pos]);
            self.push_line(line);
            rest = &rest[pos + 1..];
        }
        self.partial.push_str(rest);
    }

    /// 加入完整的一行
    pub fn push_line(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// 尚未換行的尾段
    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// 最後 n 行，舊的在前
    pub fn last_n(&self, n: usize) -> Vec<&str> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_LINES)
    }
}
