use pm2p::client::PeerClient;
use pm2p::message::{Headers, Message};
use pm2p::protocol::HELP_TEXT;
use pm2p::time::now_secs;
use pm2p_node::handler::SessionSettings;
use pm2p_node::observer::NodeEvent;
use pm2p_store::BackendKind;
use pm2p_tests::harness::node::TestNode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn hi_message() -> Message {
    Message::new(1000, Headers::from_sender("@a").topic("#t"), vec!["hi".into()]).unwrap()
}

#[tokio::test]
async fn show_and_load_a_stored_message() {
    let node = TestNode::spawn().await.unwrap();
    let msg = hi_message();
    assert!(node.state.store.append(msg.clone()).unwrap());

    let mut client = node.client("@reader").await.unwrap();
    assert_eq!(client.show(999, &[]).await.unwrap(), vec![msg.hash().to_string()]);
    assert_eq!(client.show(1000, &[]).await.unwrap(), vec![msg.hash().to_string()]);
    assert!(client.show(1001, &[]).await.unwrap().is_empty());

    let loaded = client.load(msg.hash()).await.unwrap().unwrap();
    assert_eq!(loaded, msg);
    assert_eq!(loaded.hash(), msg.hash());

    assert_eq!(client.load(&"f".repeat(64)).await.unwrap(), None);
    client.quit().await.unwrap();
}

#[tokio::test]
async fn help_and_time() {
    let node = TestNode::spawn().await.unwrap();
    let mut client = node.client("@curious").await.unwrap();
    assert_eq!(client.help().await.unwrap(), HELP_TEXT.map(String::from).to_vec());
    let now = client.time().await.unwrap();
    assert!(now.abs_diff(now_secs()) <= 2);
}

#[tokio::test]
async fn show_filters_by_payload() {
    let node = TestNode::spawn().await.unwrap();
    let a = hi_message();
    let b = Message::new(
        2000,
        Headers::from_sender("@b").topic("#other").subject("lunch"),
        vec!["pizza".into(), "at noon".into()],
    )
    .unwrap();
    node.state.store.append(a.clone()).unwrap();
    node.state.store.append(b.clone()).unwrap();

    let mut client = node.client("@searcher").await.unwrap();
    assert_eq!(
        client.show(0, &["Topic: #t"]).await.unwrap(),
        vec![a.hash().to_string()]
    );
    assert_eq!(
        client.show(0, &["pizza", "at noon"]).await.unwrap(),
        vec![b.hash().to_string()]
    );
    assert!(client.show(0, &["no such text"]).await.unwrap().is_empty());
    assert_eq!(client.show(0, &[]).await.unwrap().len(), 2);
}

#[tokio::test]
async fn show_payload_lines_are_not_parsed_as_requests() {
    let node = TestNode::spawn().await.unwrap();
    node.state.store.append(hi_message()).unwrap();
    let mut client = node.client("@tricky").await.unwrap();
    // A payload line that looks like a request is only search text.
    assert!(client.show(0, &["QUIT!"]).await.unwrap().is_empty());
    assert!(client.time().await.is_ok());
}

#[tokio::test]
async fn show_from_the_future_is_a_violation() {
    let node = TestNode::spawn().await.unwrap();
    let mut client = node.client("@timetraveller").await.unwrap();
    client
        .send_line(format!("SHOW? {} 0", now_secs() + 86_400))
        .await
        .unwrap();
    assert!(client.next_line().await.unwrap().ends_with("was kicked"));
}

#[tokio::test]
async fn truncated_payload_ends_in_disconnect() {
    let mut node = TestNode::spawn().await.unwrap();
    let mut client = node.client("@short").await.unwrap();
    client.send_line("SHOW? 0 2").await.unwrap();
    client.send_line("only one").await.unwrap();
    drop(client);
    let line = node.wait_for_line_ending(") disconnected").await.unwrap();
    assert!(line.starts_with("@short ("));
}

#[tokio::test]
async fn oversized_show_count_is_read_line_by_line() {
    let mut node = TestNode::spawn().await.unwrap();
    let mut client = node.client("@big").await.unwrap();
    client
        .send_line(format!("SHOW? 0 {}", usize::MAX))
        .await
        .unwrap();
    client.send_line("From: @a").await.unwrap();
    drop(client);
    let line = node.wait_for_line_ending(") disconnected").await.unwrap();
    assert!(line.starts_with("@big ("));
    node.wait_for(|e| *e == NodeEvent::PeersDrained).await.unwrap();
    assert!(node.manager.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn oversized_entries_count_is_an_error_not_a_crash() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(format!("ENTRIES {}\nabc\n", usize::MAX).as_bytes())
            .await
            .unwrap();
        // Hold the socket until the request line arrives, then hang up.
        let mut buf = [0u8; 64];
        let _ = stream.read(&mut buf).await;
    });

    let mut client = PeerClient::open(addr).await.unwrap();
    assert!(client.show(0, &[]).await.is_err());
    server.await.unwrap();
}

#[tokio::test]
async fn idle_peers_are_dropped() {
    let settings = SessionSettings {
        min_version: 1,
        idle_timeout: Some(std::time::Duration::from_millis(200)),
    };
    let mut node = TestNode::spawn_with(BackendKind::Log, settings).await.unwrap();
    let mut client = node.client("@idle").await.unwrap();
    node.wait_for_line_ending(") disconnected").await.unwrap();
    assert_eq!(client.try_next_line().await.unwrap(), None);
}

#[tokio::test]
async fn sqlite_backed_node_answers_requests() {
    let node = TestNode::spawn_with(BackendKind::Sqlite, SessionSettings::default())
        .await
        .unwrap();
    let msg = node
        .state
        .store
        .compose(Headers::from_sender("@me"), vec!["stored in sqlite".into()])
        .unwrap();
    let mut client = node.client("@reader").await.unwrap();
    assert_eq!(client.load(msg.hash()).await.unwrap(), Some(msg));
}
