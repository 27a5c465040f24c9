//! 終端機輸出
//!
//! 註冊 `to_user_hook`，把訊息片段連同 SGR 序列寫到 stdout。

use std::io::{self, Write};
use std::sync::Mutex;

use mudcore::{hook_fn, Engine, Hook, HookArgs, HookError, HookResult, Message};

const RESET: &str = "\x1b[0m";

/// 把訊息轉成終端機文字，每段都帶自己的 SGR
pub fn render(message: &Message) -> String {
    let mut out = String::new();
    let mut styled = false;
    for fragment in &message.fragments {
        if fragment.style.is_default() {
            if styled {
                out.push_str(RESET);
                styled = false;
            }
        } else {
            out.push_str(&fragment.style.to_sgr());
            styled = true;
        }
        out.push_str(&fragment.text);
    }
    if styled {
        out.push_str(RESET);
    }
    out
}

/// 註冊輸出端；所有寫入都經過同一把鎖
pub fn install(engine: &mut Engine) {
    let stdout = Mutex::new(io::stdout());
    engine.hooks_mut().register(
        Hook::ToUser,
        hook_fn(move |args| {
            let HookArgs::ToUser { message } = args else {
                return Ok(HookResult::Pass);
            };
            let mut out = stdout
                .lock()
                .map_err(|_| HookError::failed("stdout 鎖已損壞"))?;
            out.write_all(render(message).as_bytes())
                .and_then(|_| out.flush())
                .map_err(|e| HookError::failed(format!("寫入 stdout 失敗: {}", e)))?;
            Ok(HookResult::Pass)
        }),
    );

    engine.hooks_mut().register(
        Hook::Echo,
        hook_fn(|args| {
            if let HookArgs::Echo { session, remote } = args {
                tracing::debug!("[{}] 伺服器回顯: {}", session, remote);
            }
            Ok(HookResult::Pass)
        }),
    );
}
