//! End-to-end tests: a session talking to a service over loopback TCP.
//!
//! Timings are shortened so reconnects and ready re-announcements happen
//! within a few hundred milliseconds.

use puppet_service::client::TcpConnector;
use puppet_service::{
    ClientOptions, EventKind, FileBox, IpcServerHandle, MemoryWatermarkStore, MockPuppet,
    Puppet, PuppetEvent, PuppetService, PuppetServiceError, PuppetSession, ReconnectTiming,
    ServerOptions, SessionOptions, SqliteWatermarkStore, WatermarkStore,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const TOKEN: &str = "insecure_integration";

fn timing() -> ReconnectTiming {
    ReconnectTiming {
        attempt_timeout: Duration::from_millis(500),
        retry_delay: Duration::from_millis(50),
        login_timeout: Duration::from_millis(500),
        ready_timeout: Duration::from_millis(500),
    }
}

async fn serve(puppet: Arc<MockPuppet>) -> (Arc<PuppetService<MockPuppet>>, IpcServerHandle) {
    let service = PuppetService::with_ready_grace(puppet, Duration::from_millis(50));
    let handle = service
        .serve(ServerOptions::new("127.0.0.1:0", TOKEN).with_server_name("puppet.test"))
        .await
        .unwrap();
    (service, handle)
}

fn client_options(handle: &IpcServerHandle) -> ClientOptions {
    ClientOptions::new(handle.addr().to_string(), TOKEN).with_timeout(Duration::from_secs(2))
}

fn connect_session(handle: &IpcServerHandle, store: Arc<dyn WatermarkStore>) -> Arc<PuppetSession> {
    let client = client_options(handle);
    let options = SessionOptions::new(client.clone()).with_timing(timing());
    let connector = TcpConnector::new(client).with_first_heartbeat_timeout(Duration::from_secs(1));
    PuppetSession::with_connector(options, Arc::new(connector), store)
}

fn logged_in_puppet(account: &str) -> Arc<MockPuppet> {
    let puppet = Arc::new(MockPuppet::new());
    puppet.login(account);
    puppet.mark_ready();
    puppet
}

fn record(session: &PuppetSession) -> Arc<Mutex<Vec<PuppetEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in EventKind::ALL {
        let seen = seen.clone();
        session.events().on(kind, move |e| {
            seen.lock().unwrap().push(e.clone());
        });
    }
    seen
}

fn count(seen: &Mutex<Vec<PuppetEvent>>, kind: EventKind) -> usize {
    seen.lock().unwrap().iter().filter(|e| e.kind() == kind).count()
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Timed out waiting for {}", what);
}

#[tokio::test]
async fn test_session_sees_login_then_ready() {
    let puppet = logged_in_puppet("wxid_a1");
    let (_service, mut handle) = serve(puppet.clone()).await;
    let session = connect_session(&handle, Arc::new(MemoryWatermarkStore::new()));
    let seen = record(&session);

    session.start().await.unwrap();
    wait_until("ready", || count(&seen, EventKind::Ready) == 1).await;

    let kinds: Vec<EventKind> = seen
        .lock()
        .unwrap()
        .iter()
        .map(PuppetEvent::kind)
        .filter(|k| *k != EventKind::Heartbeat)
        .collect();
    assert_eq!(kinds, vec![EventKind::Login, EventKind::Ready]);
    assert_eq!(session.current_user_id().as_deref(), Some("wxid_a1"));
    assert!(puppet.is_started());

    session.stop().await.unwrap();
    handle.shutdown();
}

#[tokio::test]
async fn test_second_subscriber_is_rejected() {
    let puppet = logged_in_puppet("wxid_a1");
    let (service, mut handle) = serve(puppet).await;
    let first = connect_session(&handle, Arc::new(MemoryWatermarkStore::new()));
    first.start().await.unwrap();

    let second = connect_session(&handle, Arc::new(MemoryWatermarkStore::new()));
    let result = second.start().await;

    assert!(matches!(result, Err(PuppetServiceError::AlreadyBusy)));
    assert!(service.sink().is_attached());
    first.ding("still here").await.unwrap();

    first.stop().await.unwrap();
    handle.shutdown();
}

#[tokio::test]
async fn test_broken_stream_resumes_silently() {
    let puppet = logged_in_puppet("wxid_a1");
    let (service, mut handle) = serve(puppet.clone()).await;
    let session = connect_session(&handle, Arc::new(MemoryWatermarkStore::new()));
    session.start().await.unwrap();
    wait_until("ready", || session.is_ready()).await;
    let seen = record(&session);
    let seq_before = session.watermark().unwrap().last_event_seq;
    let first_stream = service.sink().attached_stream();

    service.sink().detach().unwrap();
    wait_until("resubscription", || {
        let current = service.sink().attached_stream();
        current.is_some() && current != first_stream && !session.is_reconnecting()
    })
    .await;

    session.ding("after reconnect").await.unwrap();
    wait_until("dong", || count(&seen, EventKind::Dong) == 1).await;

    assert_eq!(count(&seen, EventKind::Login), 0);
    assert_eq!(count(&seen, EventKind::Logout), 0);
    assert_eq!(count(&seen, EventKind::Reset), 0);
    assert!(session.is_logged_in());
    assert!(session.watermark().unwrap().last_event_seq > seq_before);

    session.stop().await.unwrap();
    handle.shutdown();
}

#[tokio::test]
async fn test_account_switch_forces_full_reset() {
    let puppet = logged_in_puppet("wxid_a1");
    let (service, mut handle) = serve(puppet.clone()).await;
    let session = connect_session(&handle, Arc::new(MemoryWatermarkStore::new()));
    session.start().await.unwrap();
    wait_until("ready", || session.is_ready()).await;
    let seen = record(&session);

    service.sink().detach().unwrap();
    // Dropped: nobody is attached yet.
    puppet.login("wxid_b2");

    wait_until("new login", || count(&seen, EventKind::Login) == 1).await;

    let events = seen.lock().unwrap().clone();
    let significant: Vec<&PuppetEvent> = events
        .iter()
        .filter(|e| e.kind() != EventKind::Heartbeat)
        .collect();
    assert_eq!(significant[0].kind(), EventKind::Reset);
    assert_eq!(*significant[1], PuppetEvent::logout("wxid_a1", "reset"));
    assert_eq!(*significant[2], PuppetEvent::login("wxid_b2"));
    assert_eq!(session.current_user_id().as_deref(), Some("wxid_b2"));

    session.stop().await.unwrap();
    handle.shutdown();
}

#[tokio::test]
async fn test_exhausted_retry_budget_forces_full_reset() {
    let puppet = logged_in_puppet("wxid_a1");
    let (_service, mut handle) = serve(puppet).await;
    let session = connect_session(&handle, Arc::new(MemoryWatermarkStore::new()));
    session.start().await.unwrap();
    wait_until("ready", || session.is_ready()).await;
    let seen = record(&session);

    handle.shutdown();

    wait_until("synthetic logout", || count(&seen, EventKind::Logout) == 1).await;

    let events = seen.lock().unwrap().clone();
    match &events[0] {
        PuppetEvent::Reset { data } => assert!(data.contains("attempts"), "reset: {}", data),
        other => panic!("Expected reset, got {:?}", other),
    }
    assert_eq!(events[1], PuppetEvent::logout("wxid_a1", "reset"));
    assert!(!session.is_logged_in());
    assert!(session.watermark().is_none());
}

#[tokio::test]
async fn test_stop_raises_one_logout() {
    let puppet = logged_in_puppet("wxid_a1");
    let (_service, mut handle) = serve(puppet.clone()).await;
    let session = connect_session(&handle, Arc::new(MemoryWatermarkStore::new()));
    session.start().await.unwrap();
    wait_until("ready", || session.is_ready()).await;
    let seen = record(&session);

    session.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[PuppetEvent::logout("wxid_a1", "puppet stop()")]
    );
    assert!(!puppet.is_started());
    handle.shutdown();
}

#[tokio::test]
async fn test_restarted_client_resumes_from_disk() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("watermark.sqlite");
    let puppet = logged_in_puppet("wxid_a1");
    let (service, mut handle) = serve(puppet).await;

    let store = Arc::new(SqliteWatermarkStore::new(&db).unwrap());
    let session = connect_session(&handle, store);
    session.start().await.unwrap();
    wait_until("ready", || session.is_ready()).await;
    let last_seq = session.watermark().unwrap().last_event_seq;

    // Simulate a crash: the client goes away without a stop.
    drop(session);
    service.sink().detach().unwrap();

    let store = Arc::new(SqliteWatermarkStore::new(&db).unwrap());
    let resumed = connect_session(&handle, store);
    resumed.start().await.unwrap();

    let mark = resumed.watermark().unwrap();
    assert!(mark.last_event_seq > last_seq);
    assert_eq!(mark.account_id.as_deref(), Some("wxid_a1"));

    resumed.stop().await.unwrap();
    handle.shutdown();
}

#[tokio::test]
async fn test_payloads_and_file_transfer() {
    let puppet = logged_in_puppet("wxid_a1");
    let (_service, mut handle) = serve(puppet.clone()).await;
    let session = connect_session(&handle, Arc::new(MemoryWatermarkStore::new()));
    session.start().await.unwrap();

    let me = session.contact_payload("wxid_a1").await.unwrap();
    assert_eq!(me.name, "wxid_a1");
    assert!(session.contact_list().await.unwrap().contains(&"wxid_a1".to_string()));

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let sent = session
        .message_send_file("wxid_b2", &FileBox::new("blob.bin", data.clone()))
        .await
        .unwrap()
        .unwrap();
    let message = session.message_payload(&sent).await.unwrap();
    assert_eq!(message.filename.as_deref(), Some("blob.bin"));

    let back = session.message_file(&sent).await.unwrap();
    assert_eq!(back.name, "blob.bin");
    assert_eq!(back.data.as_ref(), data.as_slice());

    assert_eq!(puppet.version(), session.version().await.unwrap());

    session.stop().await.unwrap();
    handle.shutdown();
}
