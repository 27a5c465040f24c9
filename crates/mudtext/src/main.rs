//! MUD 文字模式客戶端
//!
//! 用法：`mudtext [主機 埠號]`。輸入 `#end` 或送出 EOF 結束。

mod commands;
mod ui;

use std::process::ExitCode;

use mudcore::{Engine, EngineConfig, EngineHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // 初始化日誌，輸出到 stderr 避免和 MUD 文字混在一起
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let mut engine = Engine::new(EngineConfig::load());
    ui::install(&mut engine);
    commands::install(&mut engine);

    let handle = engine.handle();
    if let Some((host, port)) = target_from_args() {
        handle.user_input(format!("#session main {} {}", host, port));
    }
    tokio::spawn(read_stdin(handle));

    if let Err(e) = engine.start_timer() {
        error!("計時器啟動失敗: {}", e);
    }

    match engine.run().await {
        Ok(()) => {
            info!("正常結束，共處理 {} 個事件", engine.processed());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// 命令列的 `主機 埠號`
fn target_from_args() -> Option<(String, u16)> {
    let mut args = std::env::args().skip(1);
    let host = args.next()?;
    let port = args.next().and_then(|p| p.parse().ok()).unwrap_or(23);
    Some((host, port))
}

/// 讀取鍵盤輸入；EOF 時要求引擎停止
async fn read_stdin(handle: EngineHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handle.user_input(line),
            Ok(None) => break,
            Err(e) => {
                error!("讀取輸入失敗: {}", e);
                break;
            }
        }
    }
    // 有連線的 session 會在停止時一併關閉
    handle.shutdown();
}
