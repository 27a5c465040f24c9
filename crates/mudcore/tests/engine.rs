//! 透過公開介面驅動整個引擎

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mudcore::{
    hook_fn, Engine, EngineConfig, EngineError, Hook, HookArgs, HookError, HookResult,
    PRIORITY_FIRST, PRIORITY_LAST,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

type Log<T> = Arc<Mutex<Vec<T>>>;

fn capture_output(engine: &mut Engine) -> Log<String> {
    let log: Log<String> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    engine.hooks_mut().register(
        Hook::ToUser,
        hook_fn(move |args| {
            if let HookArgs::ToUser { message } = args {
                sink.lock().unwrap().push(message.text.clone());
            }
            Ok(HookResult::Pass)
        }),
    );
    log
}

fn count_hook(engine: &mut Engine, hook: Hook) -> Arc<Mutex<u32>> {
    let count = Arc::new(Mutex::new(0));
    let c = count.clone();
    engine.hooks_mut().register(
        hook,
        hook_fn(move |_| {
            *c.lock().unwrap() += 1;
            Ok(HookResult::Pass)
        }),
    );
    count
}

#[test]
fn test_events_from_other_threads_keep_order() {
    let mut engine = Engine::new(EngineConfig::default());
    let seen: Log<u64> = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    engine.hooks_mut().register(
        Hook::Timer,
        hook_fn(move |args| {
            if let HookArgs::Timer { tick } = args {
                s.lock().unwrap().push(*tick);
            }
            Ok(HookResult::Pass)
        }),
    );

    let handle = engine.handle();
    std::thread::spawn(move || {
        for tick in 1..=100 {
            handle.spam(HookArgs::Timer { tick });
        }
    })
    .join()
    .unwrap();
    engine.run_pending().unwrap();

    assert_eq!(*seen.lock().unwrap(), (1..=100).collect::<Vec<u64>>());
}

#[test]
fn test_hooks_run_by_priority_then_registration() {
    let mut engine = Engine::new(EngineConfig::default());
    let order: Log<&'static str> = Arc::new(Mutex::new(Vec::new()));
    let entries = [
        ("late", PRIORITY_LAST),
        ("first", PRIORITY_FIRST),
        ("mid", 50),
        ("mid2", 50),
    ];
    for (name, priority) in entries {
        let o = order.clone();
        engine.hooks_mut().register_with_priority(
            Hook::Timer,
            hook_fn(move |_| {
                o.lock().unwrap().push(name);
                Ok(HookResult::Pass)
            }),
            priority,
        );
    }

    engine.handle().spam(HookArgs::Timer { tick: 1 });
    engine.run_pending().unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first", "mid", "mid2", "late"]);
}

#[test]
fn test_default_threshold_with_many_failing_callbacks() {
    let mut engine = Engine::new(EngineConfig::default());
    let too_many = count_hook(&mut engine, Hook::TooManyErrors);
    let shutdowns = count_hook(&mut engine, Hook::Shutdown);
    for i in 0..25 {
        engine.hooks_mut().register(
            Hook::Timer,
            hook_fn(move |_| Err(HookError::failed(format!("callback {}", i)))),
        );
    }

    engine.handle().spam(HookArgs::Timer { tick: 1 });
    engine.handle().spam(HookArgs::Timer { tick: 2 });
    let result = engine.run_pending();

    assert!(matches!(result, Err(EngineError::TooManyErrors(21))));
    assert_eq!(*too_many.lock().unwrap(), 1);
    assert_eq!(*shutdowns.lock().unwrap(), 1);
    assert_eq!(engine.processed(), 1);
}

#[tokio::test]
async fn test_loopback_session_lifecycle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"Welcome\r\n").await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        while !received.ends_with(b"\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    let mut engine = Engine::new(EngineConfig::default());
    let output = capture_output(&mut engine);
    let connects = count_hook(&mut engine, Hook::Connect);

    // 收到歡迎訊息就送出指令，伺服器斷線後結束引擎
    let handle = engine.handle();
    engine.hooks_mut().register(
        Hook::FromMud,
        hook_fn(move |args| {
            if let HookArgs::FromMud { data, .. } = args {
                if data.contains("Welcome") {
                    handle.user_input("look");
                }
            }
            Ok(HookResult::Pass)
        }),
    );
    let handle = engine.handle();
    engine.hooks_mut().register(
        Hook::Disconnect,
        hook_fn(move |_| {
            handle.shutdown();
            Ok(HookResult::Pass)
        }),
    );

    engine.create_session("a").unwrap();
    engine.set_current("a").unwrap();
    engine.connect("a", "127.0.0.1", port).unwrap();

    tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("engine did not stop")
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received, b"look\r\n");
    assert_eq!(*connects.lock().unwrap(), 1);
    assert!(engine.session("a").unwrap().connection().is_none());
    let output = output.lock().unwrap();
    assert!(output.iter().any(|t| t.contains("Welcome")));
    assert!(output.iter().any(|t| t.contains("已連線到 127.0.0.1")));
}

#[tokio::test]
async fn test_connect_refused_reports_status() {
    // 先佔用再釋放一個埠，確保沒有人在聽
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut engine = Engine::new(EngineConfig::default());
    let output = capture_output(&mut engine);
    let handle = engine.handle();
    engine.hooks_mut().register(
        Hook::ToUser,
        hook_fn(move |args| {
            if let HookArgs::ToUser { message } = args {
                if message.text.contains("連線失敗") {
                    handle.shutdown();
                }
            }
            Ok(HookResult::Pass)
        }),
    );

    engine.create_session("a").unwrap();
    engine.connect("a", "127.0.0.1", port).unwrap();
    tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("engine did not stop")
        .unwrap();

    assert!(engine.session("a").unwrap().connection().is_none());
    assert_eq!(engine.error_count(), 0);
    assert!(output.lock().unwrap().iter().any(|t| t.contains("連線失敗")));
}
