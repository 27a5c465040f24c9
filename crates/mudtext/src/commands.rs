//! 客戶端指令
//!
//! 以 `#` 開頭的輸入在 `user_filter_hook` 最前面攔下，轉成 session 指令事件；
//! 不認得的 `#` 指令原樣送往伺服器。

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use mudcore::{
    hook_fn, Engine, EngineHandle, Hook, HookArgs, HookResult, Message, SessionCommand,
    PRIORITY_FIRST,
};
use tracing::debug;

/// 解析後的指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `#session name host port`
    Open { name: String, host: String, port: u16 },
    /// `#switch name`
    Switch(String),
    /// `#zap [name]`
    Zap(Option<String>),
    /// `#remove name`
    Remove(String),
    /// `#snoop name on|off`
    Snoop { name: String, on: bool },
    /// `#set key value`
    Set { key: String, value: String },
    /// `#charset label`，作用在目前的 session
    Charset(String),
    /// `#end`
    End,
    /// 參數錯誤，附上用法
    Usage(&'static str),
}

/// 解析一行輸入；不是客戶端指令時回傳 `None`
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim();
    let rest = line.strip_prefix('#')?;
    let mut words = rest.split_whitespace();
    let name = words.next()?;
    let args: Vec<&str> = words.collect();

    let command = match name {
        "session" => match args.as_slice() {
            [name, host, port] => match port.parse() {
                Ok(port) => Command::Open {
                    name: name.to_string(),
                    host: host.to_string(),
                    port,
                },
                Err(_) => Command::Usage("#session <名稱> <主機> <埠號>"),
            },
            _ => Command::Usage("#session <名稱> <主機> <埠號>"),
        },
        "switch" => match args.as_slice() {
            [name] => Command::Switch(name.to_string()),
            _ => Command::Usage("#switch <名稱>"),
        },
        "zap" => match args.as_slice() {
            [] => Command::Zap(None),
            [name] => Command::Zap(Some(name.to_string())),
            _ => Command::Usage("#zap [名稱]"),
        },
        "remove" => match args.as_slice() {
            [name] => Command::Remove(name.to_string()),
            _ => Command::Usage("#remove <名稱>"),
        },
        "snoop" => match args.as_slice() {
            [name, "on"] => Command::Snoop {
                name: name.to_string(),
                on: true,
            },
            [name, "off"] => Command::Snoop {
                name: name.to_string(),
                on: false,
            },
            _ => Command::Usage("#snoop <名稱> on|off"),
        },
        "set" => match args.as_slice() {
            [key, value @ ..] if !value.is_empty() => Command::Set {
                key: key.to_string(),
                value: value.join(" "),
            },
            _ => Command::Usage("#set <變數> <值>"),
        },
        "charset" => match args.as_slice() {
            [label] => Command::Charset(label.to_string()),
            _ => Command::Usage("#charset <編碼>"),
        },
        "end" => Command::End,
        _ => return None,
    };
    Some(command)
}

/// 指令需要知道的 session 狀態，由 hook 維護
#[derive(Debug, Default)]
struct Known {
    sessions: BTreeSet<String>,
    current: String,
}

/// 把指令轉成引擎事件
fn dispatch(handle: &EngineHandle, known: &Known, command: Command) {
    match command {
        Command::Open { name, host, port } => {
            if !known.sessions.contains(&name) {
                handle.session(SessionCommand::Create { name: name.clone() });
            }
            handle.session(SessionCommand::Connect {
                name: name.clone(),
                host,
                port,
            });
            handle.session(SessionCommand::SetCurrent { name });
        }
        Command::Switch(name) => handle.session(SessionCommand::SetCurrent { name }),
        Command::Zap(name) => handle.session(SessionCommand::Disconnect {
            name: name.unwrap_or_else(|| known.current.clone()),
        }),
        Command::Remove(name) => handle.session(SessionCommand::Remove { name }),
        Command::Snoop { name, on } => handle.session(SessionCommand::SetSnoop { name, on }),
        Command::Set { key, value } => handle.session(SessionCommand::SetVariable {
            name: known.current.clone(),
            key,
            value,
        }),
        Command::Charset(label) => handle.session(SessionCommand::SetCharset {
            name: known.current.clone(),
            label,
        }),
        Command::End => handle.shutdown(),
        Command::Usage(usage) => handle.output(Message::status(None, format!("用法: {}", usage))),
    }
}

/// 註冊指令處理與 session 追蹤
pub fn install(engine: &mut Engine) {
    let known = Arc::new(Mutex::new(Known {
        sessions: engine.sessions().names().into_iter().map(String::from).collect(),
        current: engine.current_session().to_string(),
    }));

    let state = known.clone();
    engine.hooks_mut().register(
        Hook::SessionCreated,
        hook_fn(move |args| {
            if let (HookArgs::SessionCreated { session, .. }, Ok(mut known)) = (args, state.lock()) {
                known.sessions.insert(session.clone());
            }
            Ok(HookResult::Pass)
        }),
    );
    let state = known.clone();
    engine.hooks_mut().register(
        Hook::SessionRemoved,
        hook_fn(move |args| {
            if let (HookArgs::SessionRemoved { session }, Ok(mut known)) = (args, state.lock()) {
                known.sessions.remove(session);
            }
            Ok(HookResult::Pass)
        }),
    );
    let state = known.clone();
    engine.hooks_mut().register(
        Hook::SessionChange,
        hook_fn(move |args| {
            if let (HookArgs::SessionChange { new, .. }, Ok(mut known)) = (args, state.lock()) {
                known.current = new.clone();
            }
            Ok(HookResult::Pass)
        }),
    );

    let handle = engine.handle();
    engine.hooks_mut().register_with_priority(
        Hook::UserFilter,
        hook_fn(move |args| {
            let HookArgs::UserFilter {
                internal: false,
                verbatim: false,
                dataadj,
                ..
            } = args
            else {
                return Ok(HookResult::Pass);
            };
            let Some(command) = parse(dataadj) else {
                return Ok(HookResult::Pass);
            };
            debug!("客戶端指令: {:?}", command);
            let known = known
                .lock()
                .map_err(|_| mudcore::HookError::failed("session 狀態鎖已損壞"))?;
            dispatch(&handle, &known, command);
            Ok(HookResult::Stop)
        }),
        PRIORITY_FIRST,
    );
}
