use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response as AxumResponse,
    routing::get,
    Router,
};
use shared::{
    domain::Role,
    protocol::{FrameError, UnseenCountUpdate},
};
use tokio::net::TcpListener;

use super::*;

fn frame_text(conversation: &str, count: u64) -> String {
    format!(
        r#"{{"type":"UNSEEN_COUNT_UPDATE","payload":{{"conversationId":"{conversation}","count":{count}}}}}"#
    )
}

fn test_channel(
    actor: &str,
    role: Role,
) -> (Arc<NotificationChannel>, broadcast::Receiver<NotificationEvent>) {
    let (events, rx) = broadcast::channel(64);
    let channel = NotificationChannel::new(ActorIdentity::new(actor, role), events);
    (channel, rx)
}

#[test]
fn parse_recognizes_unseen_count_updates() {
    let frame = NotificationFrame::parse(&frame_text("c1", 3)).expect("parse");
    assert_eq!(
        frame,
        NotificationFrame::UnseenCountUpdate(UnseenCountUpdate {
            conversation_id: ConversationId("c1".into()),
            count: 3,
        })
    );
}

#[test]
fn parse_keeps_unrecognized_tags_as_unknown() {
    let frame = NotificationFrame::parse(r#"{"type":"ORDER_PLACED","payload":{"orderId":"o1"}}"#)
        .expect("parse");
    assert_eq!(
        frame,
        NotificationFrame::Unknown {
            tag: "ORDER_PLACED".into()
        }
    );
}

#[test]
fn parse_rejects_malformed_frames() {
    assert!(matches!(
        NotificationFrame::parse("not even json"),
        Err(FrameError::Malformed(_))
    ));
    assert!(matches!(
        NotificationFrame::parse(r#"{"type":"UNSEEN_COUNT_UPDATE","payload":{"conversationId":7}}"#),
        Err(FrameError::Payload { .. })
    ));
}

#[test]
fn identity_frame_encodes_role_and_actor_id() {
    let (channel, _rx) = test_channel("s42", Role::Seller);
    assert_eq!(channel.identity_frame(), "seller_s42");
}

#[tokio::test]
async fn channel_exposes_no_state_before_the_identity_handshake() {
    let (channel, _rx) = test_channel("b1", Role::Buyer);
    assert_eq!(channel.phase().await, ChannelPhase::Connecting);
    assert!(channel.unseen_counts().await.is_none());
    assert!(channel.count_for(&ConversationId("c1".into())).await.is_none());

    // Frames delivered before readiness are dropped, not buffered.
    channel
        .apply(ChannelInput::Frame(frame_text("c1", 3)))
        .await;
    channel.apply(ChannelInput::Opened).await;

    assert!(channel.is_ready().await);
    assert_eq!(channel.unseen_counts().await, Some(HashMap::new()));
}

#[tokio::test]
async fn last_received_count_wins_per_conversation() {
    let (channel, _rx) = test_channel("b1", Role::Buyer);
    channel.apply(ChannelInput::Opened).await;

    channel
        .apply(ChannelInput::Frame(frame_text("c1", 3)))
        .await;
    channel
        .apply(ChannelInput::Frame(frame_text("c2", 7)))
        .await;
    channel
        .apply(ChannelInput::Frame(frame_text("c1", 5)))
        .await;

    let counts = channel.unseen_counts().await.expect("ready");
    assert_eq!(counts.get(&ConversationId("c1".into())), Some(&5));
    assert_eq!(counts.get(&ConversationId("c2".into())), Some(&7));
    assert_eq!(
        channel.count_for(&ConversationId("c3".into())).await,
        Some(0)
    );
}

#[tokio::test]
async fn unknown_and_malformed_frames_leave_state_untouched() {
    let (channel, _rx) = test_channel("b1", Role::Buyer);
    channel.apply(ChannelInput::Opened).await;
    channel
        .apply(ChannelInput::Frame(frame_text("c1", 3)))
        .await;

    channel
        .apply(ChannelInput::Frame(
            r#"{"type":"PROMO_STARTED","payload":{"shopId":"s9"}}"#.into(),
        ))
        .await;
    channel
        .apply(ChannelInput::Frame("garbled ][".into()))
        .await;

    assert!(channel.is_ready().await);
    let counts = channel.unseen_counts().await.expect("ready");
    assert_eq!(counts.len(), 1);
    assert_eq!(counts.get(&ConversationId("c1".into())), Some(&3));
}

#[tokio::test]
async fn close_empties_the_map_and_detaches_consumers() {
    let (channel, _rx) = test_channel("b1", Role::Buyer);
    channel.apply(ChannelInput::Opened).await;
    channel
        .apply(ChannelInput::Frame(frame_text("c1", 3)))
        .await;

    channel.apply(ChannelInput::Closed).await;

    assert_eq!(channel.phase().await, ChannelPhase::Closed);
    assert!(channel.unseen_counts().await.is_none());

    // A straggler frame after close changes nothing.
    channel
        .apply(ChannelInput::Frame(frame_text("c1", 9)))
        .await;
    assert!(channel.unseen_counts().await.is_none());
}

#[tokio::test]
async fn every_transition_publishes_a_typed_event() {
    let (channel, mut rx) = test_channel("a3", Role::Admin);

    channel.apply(ChannelInput::Opened).await;
    channel
        .apply(ChannelInput::Frame(frame_text("c1", 4)))
        .await;
    channel.apply(ChannelInput::Closed).await;

    assert!(matches!(
        rx.recv().await.expect("event"),
        NotificationEvent::ChannelReady
    ));
    match rx.recv().await.expect("event") {
        NotificationEvent::UnseenCountChanged {
            conversation_id,
            count,
        } => {
            assert_eq!(conversation_id, ConversationId("c1".into()));
            assert_eq!(count, 4);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        rx.recv().await.expect("event"),
        NotificationEvent::ChannelClosed
    ));
}

#[derive(Clone)]
struct WsServerState {
    announced: Arc<Mutex<Option<String>>>,
    frames: Vec<String>,
}

async fn ws_route(State(state): State<WsServerState>, upgrade: WebSocketUpgrade) -> AxumResponse {
    upgrade.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: WsServerState) {
    if let Some(Ok(WsMessage::Text(identity))) = socket.recv().await {
        *state.announced.lock().await = Some(identity);
    }
    for frame in &state.frames {
        if socket.send(WsMessage::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    // Hold the connection open until the client goes away.
    while socket.recv().await.is_some() {}
}

async fn spawn_ws_server(frames: Vec<String>) -> Result<(Url, WsServerState)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = WsServerState {
        announced: Arc::new(Mutex::new(None)),
        frames,
    };
    let app = Router::new()
        .route("/ws", get(ws_route))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let url = Url::parse(&format!("ws://{addr}/ws")).expect("ws url");
    Ok((url, state))
}

#[tokio::test]
async fn websocket_connector_announces_identity_then_feeds_frames() {
    let (url, state) = spawn_ws_server(vec![
        frame_text("c1", 3),
        frame_text("c1", 5),
        frame_text("c2", 2),
    ])
    .await
    .expect("spawn ws server");

    let (events, _rx) = broadcast::channel(64);
    let channel = NotificationChannel::new(ActorIdentity::new("b7", Role::Buyer), events);
    let connector = WebSocketConnector::new(url);
    let _connection = connector
        .open(Arc::clone(&channel))
        .await
        .expect("open channel");

    // Readiness is flipped before open returns, right after the identity
    // frame went out.
    assert!(channel.is_ready().await);

    let mut counts = None;
    for _ in 0..200 {
        let snapshot = channel.unseen_counts().await.expect("ready");
        if snapshot.len() == 2 {
            counts = Some(snapshot);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let counts = counts.expect("both conversations observed");
    assert_eq!(counts.get(&ConversationId("c1".into())), Some(&5));
    assert_eq!(counts.get(&ConversationId("c2".into())), Some(&2));

    assert_eq!(
        state.announced.lock().await.clone(),
        Some("buyer_b7".to_string())
    );
}
