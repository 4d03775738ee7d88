//! End-to-end call scenarios
//!
//! Drives a [`Softphone`] over the loopback adapter against a mock backend:
//! - number normalisation before dialling
//! - microphone refusal leaving the phone idle
//! - duplicate hangup signals producing a single log POST
//! - calls with no client association never reaching the backend

use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{self, timeout};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use link_phone_core::{
    BackendClient, CallAssociation, CallEvent, CallLogRecord, CallStatus, LoopbackAdapter,
    LoopbackRemote, NoticeSeverity, PhoneConfig, PhoneError, PhoneEvent, Softphone,
    StaticProvisioner,
};

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn backed_phone(server: &MockServer, association: CallAssociation) -> (Softphone, LoopbackRemote) {
    let config = PhoneConfig::new().with_api_base_url(format!("{}/api", server.uri()));
    let adapter = LoopbackAdapter::new();
    let remote = adapter.remote();
    let phone = Softphone::builder()
        .call_logger(BackendClient::new(&config).unwrap())
        .config(config)
        .adapter(adapter)
        .association(association)
        .provisioner(StaticProvisioner::new(LoopbackAdapter::credentials()))
        .build()
        .unwrap();
    phone.initialize().await.unwrap();
    (phone, remote)
}

async fn wait_for_logged(events: &mut broadcast::Receiver<PhoneEvent>) -> CallLogRecord {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(PhoneEvent::CallLogged { record }) => return record,
                Ok(PhoneEvent::Notice(notice)) => panic!("unexpected notice: {notice:?}"),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("call was never logged")
}

#[tokio::test]
async fn scenario_a_number_is_normalized_before_dialling() {
    let server = MockServer::start().await;
    let (phone, remote) = backed_phone(&server, CallAssociation::new("client-42")).await;

    phone.place_call("07912345678").await.unwrap();

    assert_eq!(remote.dialled(), vec!["+447912345678"]);
    let session = phone.snapshot().await.unwrap();
    assert_eq!(session.phone_number, "+447912345678");
    assert_eq!(session.status, CallStatus::Ringing);
}

#[tokio::test]
async fn scenario_b_microphone_denied_stays_idle() {
    let server = MockServer::start().await;
    let (phone, remote) = backed_phone(&server, CallAssociation::new("client-42")).await;
    let mut events = phone.subscribe();
    remote.deny_microphone("NotAllowedError");

    let err = phone.place_call("07912345678").await.unwrap_err();

    assert!(matches!(err, PhoneError::PermissionDenied { .. }));
    assert!(phone.snapshot().await.is_none());
    assert_eq!(phone.status().await, CallStatus::Idle);
    assert!(remote.dialled().is_empty());
    match events.try_recv().unwrap() {
        PhoneEvent::Notice(notice) => assert_eq!(notice.title, "Microphone Access Needed"),
        other => panic!("unexpected event {other:?}"),
    }

    // permission granted later, dialling works again
    remote.allow_microphone();
    phone.place_call("07912345678").await.unwrap();
    assert_eq!(phone.status().await, CallStatus::Ringing);
}

#[tokio::test]
async fn scenario_c_duplicate_termination_posts_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/log-call"))
        .and(body_partial_json(json!({
            "clientId": "client-42",
            "personId": "person-7",
            "phoneNumber": "+447912345678",
            "direction": "outbound",
            "duration": 45
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let association = CallAssociation::new("client-42").with_person("person-7");
    let (phone, remote) = backed_phone(&server, association).await;
    let mut events = phone.subscribe();

    time::pause();
    let session_id = phone.place_call("07912345678").await.unwrap();
    let call = remote.last_call().unwrap();
    call.connect();
    settle().await;
    time::advance(Duration::from_secs(45)).await;
    time::resume();

    // both hangup signals in the same tick
    call.emit(CallEvent::Terminated);
    call.emit(CallEvent::Ended);

    let record = wait_for_logged(&mut events).await;
    assert_eq!(record.duration, 45);
    assert_eq!(record.session_id, session_id);
    assert_eq!(phone.status().await, CallStatus::Disconnected);

    call.emit(CallEvent::Bye);
    phone.hang_up().await.unwrap();
    settle().await;
    server.verify().await;
}

#[tokio::test]
async fn scenario_d_missing_client_is_not_logged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/log-call"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let (phone, remote) = backed_phone(&server, CallAssociation::unassociated()).await;
    let mut events = phone.subscribe();

    phone.place_call("07912345678").await.unwrap();
    remote.last_call().unwrap().connect();
    settle().await;
    phone.hang_up().await.unwrap();
    settle().await;

    let mut notices = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PhoneEvent::Notice(notice) = event {
            notices.push(notice);
        }
    }
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].severity, NoticeSeverity::Warning);
    assert_eq!(notices[0].title, "Call Not Logged");
    assert_eq!(phone.status().await, CallStatus::Idle);
    server.verify().await;
}

#[tokio::test]
async fn backend_rejection_is_reported_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/log-call"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    let (phone, remote) = backed_phone(&server, CallAssociation::new("client-42")).await;
    let mut events = phone.subscribe();

    phone.place_call("07912345678").await.unwrap();
    remote.last_call().unwrap().connect();
    settle().await;
    phone.hang_up().await.unwrap();

    let notice = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(PhoneEvent::Notice(notice)) = events.recv().await {
                return notice;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(notice.severity, NoticeSeverity::Error);
    assert_eq!(notice.title, "Call Not Logged");
    // the call itself is still over
    assert_eq!(phone.status().await, CallStatus::Idle);
    server.verify().await;
}
