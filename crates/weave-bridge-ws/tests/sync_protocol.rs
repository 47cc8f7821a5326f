//! 端到端同步场景：双向字符串同步、数组同步、服务端重启后重连、
//! 序号缺口触发重同步。

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsFrame;

use weave_bridge_ws::{
    Envelope, EnvelopeCodec, JsonCodec, Message, UpdatePayload, WelcomePayload, WsBridgeConfig,
    WsSyncClient, WsSyncServer,
};
use weave_core::prelude::*;
use weave_core::update::{PropertyUpdate, SubjectProperties, SubjectUpdate, UpdateValue};

fn root_shape() -> Arc<SubjectShape> {
    SubjectShape::builder("Root")
        .property(PropertySpec::stored("name", ValueKind::Text))
        .property(PropertySpec::stored("ints", ValueKind::List))
        .build()
}

fn factory() -> Arc<dyn SubjectFactory> {
    Arc::new(
        |ctx: &SubjectContext, _spec: &PropertySpec, _hint: Option<&str>| {
            Ok(SubjectHandle::new(ctx, root_shape()))
        },
    )
}

fn ints(values: &[i64]) -> PropertyValue {
    PropertyValue::List(values.iter().map(|v| PropertyValue::Integer(*v)).collect())
}

async fn start_server(listener: TcpListener) -> (WsSyncServer, SubjectHandle) {
    let ctx = SubjectContext::new();
    let root = SubjectHandle::new(&ctx, root_shape());
    let server = WsSyncServer::new(ctx, root.clone(), factory(), WsBridgeConfig::default());
    tokio::spawn(server.clone().run(listener));
    (server, root)
}

fn start_client(url: &str) -> (WsSyncClient, SubjectHandle) {
    let ctx = SubjectContext::new();
    let root = SubjectHandle::new(&ctx, root_shape());
    let client = WsSyncClient::new(ctx, root.clone(), factory(), url, WsBridgeConfig::default());
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });
    (client, root)
}

/// 轮询断言：在时限内等待条件成立。
async fn wait_until(what: &str, deadline: Duration, mut check: impl FnMut() -> bool) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if check() {
            return;
        }
        time::sleep(step).await;
        waited += step;
    }
    panic!("在 {deadline:?} 内未达成：{what}");
}

/// 场景：双向字符串同步，且更新不回声振荡。
#[tokio::test(flavor = "multi_thread")]
async fn bidirectional_string_sync() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_server, server_root) = start_server(listener).await;
    let (client, client_root) = start_client(&format!("ws://{addr}"));

    server_root.set("name", "S1").unwrap();
    wait_until("client.name == S1", Duration::from_secs(5), || {
        client_root.get("name").unwrap() == PropertyValue::from("S1")
    })
    .await;

    client_root.set("name", "C1").unwrap();
    wait_until("server.name == C1", Duration::from_secs(5), || {
        server_root.get("name").unwrap() == PropertyValue::from("C1")
    })
    .await;

    // 无回声：收敛后的值保持稳定，不发生振荡。
    time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server_root.get("name").unwrap(), PropertyValue::from("C1"));
    assert_eq!(client_root.get("name").unwrap(), PropertyValue::from("C1"));
    client.shutdown();
}

/// 场景：数组同步——欢迎快照携带初值，随后整列表替换。
#[tokio::test(flavor = "multi_thread")]
async fn array_sync_via_welcome_and_broadcast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_server, server_root) = start_server(listener).await;
    server_root.set("ints", ints(&[10, 20, 30])).unwrap();

    let (client, client_root) = start_client(&format!("ws://{addr}"));
    wait_until("client.ints == 初值", Duration::from_secs(5), || {
        client_root.get("ints").unwrap() == ints(&[10, 20, 30])
    })
    .await;

    server_root.set("ints", ints(&[100, 200, 300])).unwrap();
    wait_until("client.ints == 新值", Duration::from_secs(5), || {
        client_root.get("ints").unwrap() == ints(&[100, 200, 300])
    })
    .await;
    client.shutdown();
}

/// 场景：服务端重启——客户端自动重连并无条件从新欢迎快照重同步。
#[tokio::test(flavor = "multi_thread")]
async fn reconnect_after_server_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (first_server, first_root) = start_server(listener).await;
    first_root.set("name", "before").unwrap();

    let (client, client_root) = start_client(&format!("ws://{addr}"));
    wait_until("client 同步到旧服务端", Duration::from_secs(5), || {
        client_root.get("name").unwrap() == PropertyValue::from("before")
    })
    .await;

    first_server.shutdown();
    time::sleep(Duration::from_millis(500)).await;

    // 同端口拉起全新服务端：序号历史独立于旧实例。
    let listener = TcpListener::bind(addr).await.expect("重启后端口必须可复用");
    let (_second_server, second_root) = start_server(listener).await;
    second_root.set("name", "after").unwrap();

    wait_until("client 收敛到新服务端", Duration::from_secs(10), || {
        client_root.get("name").unwrap() == PropertyValue::from("after")
    })
    .await;

    second_root.set("name", "after-2").unwrap();
    wait_until("重启后的增量同步", Duration::from_secs(5), || {
        client_root.get("name").unwrap() == PropertyValue::from("after-2")
    })
    .await;
    client.shutdown();
}

/// 手写对端：读取下一条信封。
async fn read_envelope(
    ws: &mut (impl futures_util::Stream<
        Item = Result<WsFrame, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
) -> Option<Envelope> {
    loop {
        match time::timeout(Duration::from_secs(5), ws.next()).await.ok()?? {
            Ok(WsFrame::Binary(bytes)) => return JsonCodec.decode(&bytes).ok(),
            Ok(WsFrame::Text(text)) => return JsonCodec.decode(text.as_str().as_bytes()).ok(),
            Ok(WsFrame::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn named_state(root_id: &str, name: &str) -> SubjectUpdate {
    let mut update = SubjectUpdate::new(root_id);
    let mut props = SubjectProperties::new();
    props.insert("name".into(), PropertyUpdate::Value {
        value: UpdateValue::Text { value: name.into() },
    });
    update.subjects.insert(root_id.to_owned(), props);
    update
}

/// 场景：序号缺口——客户端检测到跳号后断连重连，从新欢迎重同步。
#[tokio::test(flavor = "multi_thread")]
async fn sequence_gap_triggers_resync() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // 手写服务端：第一个连接故意制造缺口，第二个连接给出新状态。
    let fake_server = tokio::spawn(async move {
        let mut sessions = 0u32;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            sessions += 1;
            let mut ws = accept_async(stream).await.unwrap();
            // 等 Hello。
            let hello = read_envelope(&mut ws).await;
            assert!(
                matches!(
                    hello,
                    Some(Envelope {
                        message: Message::Hello(_),
                        ..
                    })
                ),
                "客户端必须先发 Hello"
            );
            if sessions == 1 {
                let welcome = Envelope::new(Message::Welcome(WelcomePayload {
                    version: 1,
                    format: "json".into(),
                    state: named_state("1", "v1"),
                    sequence: 5,
                }));
                ws.send(WsFrame::Binary(JsonCodec.encode(&welcome).unwrap().into()))
                    .await
                    .unwrap();
                // 序号从 5 跳到 7：客户端必须判定缺口并重连。
                let gap = Envelope::new(Message::Update(UpdatePayload {
                    update: named_state("1", "v2"),
                    sequence: 7,
                }));
                ws.send(WsFrame::Binary(JsonCodec.encode(&gap).unwrap().into()))
                    .await
                    .unwrap();
                // 保持连接存活，等客户端主动放弃。
                while read_envelope(&mut ws).await.is_some() {}
            } else {
                let welcome = Envelope::new(Message::Welcome(WelcomePayload {
                    version: 1,
                    format: "json".into(),
                    state: named_state("1", "v3"),
                    sequence: 1,
                }));
                ws.send(WsFrame::Binary(JsonCodec.encode(&welcome).unwrap().into()))
                    .await
                    .unwrap();
                while read_envelope(&mut ws).await.is_some() {}
                break;
            }
        }
        sessions
    });

    let (client, client_root) = start_client(&format!("ws://{addr}"));
    wait_until("第一份欢迎状态到达", Duration::from_secs(5), || {
        client_root.get("name").unwrap() == PropertyValue::from("v1")
    })
    .await;
    // 缺口更新 v2 不得被应用；重连后的欢迎给出 v3。
    wait_until("缺口触发重同步并收敛到 v3", Duration::from_secs(10), || {
        client_root.get("name").unwrap() == PropertyValue::from("v3")
    })
    .await;

    client.shutdown();
    fake_server.abort();
}
