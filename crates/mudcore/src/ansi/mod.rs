//! ANSI 顏色狀態追蹤模組
//!
//! 將 MUD 輸出中的 SGR 序列 (`ESC [ n ; n m`) 轉換為帶樣式的文字片段。
//! 伺服器送來的序列可能被切在兩個封包之間，因此每次呼叫都要帶入上一次
//! 留下的未完成片段，並回傳新的殘留片段。

use regex::Regex;

lazy_static::lazy_static! {
    /// 完整的 SGR 序列：ESC '[' 數字 (';' 數字)* 'm'
    static ref SGR_RE: Regex = Regex::new(r"\x1b\[([0-9;]*)m").unwrap();
    /// 位於結尾、尚未完成的 SGR 序列
    static ref PARTIAL_SGR_RE: Regex = Regex::new(r"\x1b(\[[0-9;]*)?\z").unwrap();
}

/// 預設顏色（前景/背景）
pub const DEFAULT_COLOR: i8 = -1;

/// 文字樣式（六個欄位）
///
/// `fg` / `bg` 為 0-7 的基本色索引，`-1` 表示終端機預設色。
/// 這個型別只能透過 [`ColorState::with_codes`] 或 [`apply`] 由舊狀態推導出新狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorState {
    bold: bool,
    underline: bool,
    blink: bool,
    reverse: bool,
    fg: i8,
    bg: i8,
}

impl ColorState {
    /// 全部為預設值的樣式
    pub const DEFAULT: Self = Self {
        bold: false,
        underline: false,
        blink: false,
        reverse: false,
        fg: DEFAULT_COLOR,
        bg: DEFAULT_COLOR,
    };

    pub fn bold(&self) -> bool {
        self.bold
    }

    pub fn underline(&self) -> bool {
        self.underline
    }

    pub fn blink(&self) -> bool {
        self.blink
    }

    pub fn reverse(&self) -> bool {
        self.reverse
    }

    pub fn fg(&self) -> i8 {
        self.fg
    }

    pub fn bg(&self) -> i8 {
        self.bg
    }

    /// 是否為全預設樣式
    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }

    /// 依序套用 SGR 參數，回傳新的樣式
    pub fn with_codes(self, codes: &[u16]) -> Self {
        codes.iter().fold(self, |state, &code| state.with_code(code))
    }

    fn with_code(mut self, code: u16) -> Self {
        match code {
            0 => return Self::DEFAULT,
            1 => self.bold = true,
            4 => self.underline = true,
            5 => self.blink = true,
            7 => self.reverse = true,
            22 => self.bold = false,
            24 => self.underline = false,
            25 => self.blink = false,
            27 => self.reverse = false,
            30..=37 => self.fg = (code - 30) as i8,
            39 => self.fg = DEFAULT_COLOR,
            40..=47 => self.bg = (code - 40) as i8,
            49 => self.bg = DEFAULT_COLOR,
            _ => {}
        }
        self
    }

    /// 將樣式重新編碼為一個 SGR 序列（先重設再設定）
    pub fn to_sgr(&self) -> String {
        let mut sgr = String::from("\x1b[0");
        for (on, code) in [
            (self.bold, "1"),
            (self.underline, "4"),
            (self.blink, "5"),
            (self.reverse, "7"),
        ] {
            if on {
                sgr.push(';');
                sgr.push_str(code);
            }
        }
        if self.fg >= 0 {
            sgr.push_str(&format!(";3{}", self.fg));
        }
        if self.bg >= 0 {
            sgr.push_str(&format!(";4{}", self.bg));
        }
        sgr.push('m');
        sgr
    }
}

impl Default for ColorState {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// 帶樣式的文字片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledText {
    pub style: ColorState,
    pub text: String,
}

impl StyledText {
    pub fn new(style: ColorState, text: impl Into<String>) -> Self {
        Self {
            style,
            text: text.into(),
        }
    }

    /// 預設樣式的純文字片段
    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(ColorState::DEFAULT, text)
    }
}

/// [`apply`] 的結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// 處理完後的樣式
    pub state: ColorState,
    /// 結尾處尚未完成的 SGR 片段，下次呼叫時需帶回
    pub leftover: String,
    /// 依序排列的 (樣式, 文字) 片段
    pub fragments: Vec<StyledText>,
}

/// 解析 SGR 參數字串；空字串等同 `0`
fn parse_codes(params: &str) -> Vec<u16> {
    if params.is_empty() {
        return vec![0];
    }
    params
        .split(';')
        .filter_map(|part| {
            if part.is_empty() {
                Some(0)
            } else {
                part.parse::<u16>().ok()
            }
        })
        .collect()
}

/// 由前一次的樣式與殘留片段，加上新的文字區塊，推導出新的樣式與片段
///
/// 串接所有片段的文字會完整重現輸入中的字面文字，且不含任何 SGR 位元組。
/// 非 SGR 的轉義序列視為一般文字。
pub fn apply(previous: ColorState, leftover: &str, chunk: &str) -> Applied {
    let mut input = String::with_capacity(leftover.len() + chunk.len());
    input.push_str(leftover);
    input.push_str(chunk);

    let (body, leftover) = match PARTIAL_SGR_RE.find(&input) {
        Some(m) => (&input[..m.start()], m.as_str().to_string()),
        None => (input.as_str(), String::new()),
    };

    let mut state = previous;
    let mut fragments = Vec::new();
    let mut last = 0;

    for caps in SGR_RE.captures_iter(body) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() > last {
            fragments.push(StyledText::new(state, &body[last..whole.start()]));
        }
        let params = caps.get(1).map_or("", |m| m.as_str());
        state = state.with_codes(&parse_codes(params));
        last = whole.end();
    }
    if last < body.len() {
        fragments.push(StyledText::new(state, &body[last..]));
    }

    Applied {
        state,
        leftover,
        fragments,
    }
}

/// 移除所有完整的 SGR 序列，供比對文字的外部元件使用
pub fn strip_ansi(text: &str) -> String {
    SGR_RE.replace_all(text, "").into_owned()
}

/// 逐區塊追蹤樣式的包裝，供 Session 保存
#[derive(Debug, Clone, Default)]
pub struct ColorTracker {
    state: ColorState,
    leftover: String,
}

impl ColorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ColorState {
        self.state
    }

    pub fn leftover(&self) -> &str {
        &self.leftover
    }

    /// 處理一個文字區塊，並以結果取代目前的狀態
    pub fn feed(&mut self, chunk: &str) -> Vec<StyledText> {
        let applied = apply(self.state, &self.leftover, chunk);
        self.state = applied.state;
        self.leftover = applied.leftover;
        applied.fragments
    }
}
