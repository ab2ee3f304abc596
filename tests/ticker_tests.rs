use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tickwatch::models::{Result, TickwatchErrorKind};
use tickwatch::proto::{FeedBody, FeedResponse};
use tickwatch::ticker::{AccessTokenSource, Ticker, TickerEvent};

struct StaticTokenSource(Option<String>);

#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn feed_token(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

fn token_source(token: &str) -> Arc<StaticTokenSource> {
    Arc::new(StaticTokenSource(Some(token.to_owned())))
}

#[tokio::test]
async fn builder_rejects_max_delay_below_base() {
    let result = Ticker::builder("http://localhost/auth", token_source("t"))
        .reconnect_max_delay(Duration::from_millis(100))
        .build();
    assert!(result.is_err());

    let result = Ticker::builder("http://localhost/auth", token_source("t"))
        .reconnect_max_delay(Duration::from_secs(30))
        .build();
    assert!(result.is_ok());
}

#[tokio::test]
async fn reconnect_delay_grows_and_caps() {
    let (ticker, _handle) = Ticker::new("http://localhost/auth", token_source("t"));

    let first = ticker.reconnect_delay(1);
    assert!(first >= Duration::from_secs(1));
    assert!(first <= Duration::from_secs(3));

    // 2^(20-1) seconds would be days; the cap holds it at a minute.
    let capped = ticker.reconnect_delay(20);
    assert_eq!(capped, Duration::from_secs(60));
}

#[tokio::test]
async fn missing_token_surfaces_upstream_auth() {
    let (mut ticker, _handle) =
        Ticker::new("http://localhost/auth", Arc::new(StaticTokenSource(None)));
    ticker.set_auto_reconnect(false);

    let err = ticker.serve().await.expect_err("must fail");
    assert!(matches!(err.kind, TickwatchErrorKind::UpstreamAuth(_)));
}

#[tokio::test]
async fn backoff_ceiling_surfaces_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (ticker, handle) = Ticker::builder(&format!("{}/auth", server.uri()), token_source("bad"))
        .reconnect_max_attempts(1)
        .build()
        .expect("build");
    let mut events = handle.subscribe_events();

    let err = ticker.serve().await.expect_err("must exhaust");
    assert!(matches!(err.kind, TickwatchErrorKind::UpstreamExhausted(1)));

    let mut saw_exhausted = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TickerEvent::Exhausted(_)) {
            saw_exhausted = true;
        }
    }
    assert!(saw_exhausted);
}

#[tokio::test]
async fn decodes_frames_and_issues_subscribe() {
    // Local upstream: one WS connection, first garbage then a real
    // frame, then echo back the first subscribe frame it reads.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let ws_addr = listener.local_addr().expect("addr");
    let (frame_tx, frame_rx) = tokio::sync::oneshot::channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws");

        ws.send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef].into()))
            .await
            .expect("send garbage");

        let mut feeds = HashMap::new();
        feeds.insert("NSE:ACME".to_owned(), FeedBody::from_ltp(101.5, Some(99.0)));
        let frame = FeedResponse { feeds }.encode_to_vec();
        ws.send(Message::Binary(frame.into())).await.expect("send frame");

        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let _ = frame_tx.send(text.to_string());
                break;
            }
        }
    });

    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "authorized_redirect_uri": format!("ws://{}", ws_addr) }
        })))
        .mount(&auth)
        .await;

    let (ticker, handle) = Ticker::builder(&format!("{}/auth", auth.uri()), token_source("test-token"))
        .auto_reconnect(false)
        .build()
        .expect("build");
    let mut events = handle.subscribe_events();
    tokio::spawn(ticker.serve());

    // Bad frame is skipped; the good one comes through decoded.
    let tick = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream") {
                TickerEvent::Tick { instrument, body } => return (instrument, body),
                _ => continue,
            }
        }
    })
    .await
    .expect("tick before timeout");
    assert_eq!(tick.0, "NSE:ACME");
    assert_eq!(tick.1.ltp(), Some(101.5));
    assert_eq!(tick.1.close(), Some(99.0));

    handle
        .subscribe(vec!["NSE:ACME".to_owned(), "NSE:OTHER".to_owned()])
        .expect("subscribe");

    let frame = tokio::time::timeout(Duration::from_secs(5), frame_rx)
        .await
        .expect("frame before timeout")
        .expect("frame");
    let value: serde_json::Value = serde_json::from_str(&frame).expect("frame json");
    assert_eq!(value["method"], "sub");
    assert_eq!(value["data"]["mode"], "full");
    assert!(value["guid"].is_string());
    assert_eq!(
        value["data"]["instrumentKeys"],
        serde_json::json!(["NSE:ACME", "NSE:OTHER"])
    );
}
