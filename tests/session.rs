mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{client, eventually, within, Call, FakeConnector, FakeRegistrar, APP_ID};
use dan::transport::{Qos, TransportEvent};
use dan::{ConnectionState, DeviceFeature, Hooks, PushMode, RegisterOptions, RegistrationError};
use serde_json::{json, Value};

fn quiet_hooks() -> Hooks {
    Hooks::new(|_, _| Ok(()), |_, _| {})
}

fn options() -> RegisterOptions {
    RegisterOptions::new("http://iottalk.local:9992/")
        .id(APP_ID)
        .name("dev1")
        .idf(DeviceFeature::new("temp", ["float"]).unwrap())
        .odf(DeviceFeature::new("lamp", ["bool"]).unwrap())
}

#[tokio::test]
async fn register_waits_for_control_subscription_and_online_presence() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);

    let info = within(client.register(options(), quiet_hooks()))
        .await
        .unwrap();

    assert_eq!(info.name, "dev1");
    assert_eq!(info.app_id.to_string(), APP_ID);
    assert_eq!(info.mqtt_host, "broker.local");
    assert_eq!(info.mqtt_port, 1883);
    assert_eq!(info.rev, json!(1));
    assert_eq!(info.ctrl_chans, ("in/ctrl".to_string(), "out/ctrl".to_string()));
    assert_eq!(client.state(), ConnectionState::Ready);

    let puts = registrar.puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].0, format!("http://iottalk.local:9992/{APP_ID}"));
    assert_eq!(puts[0].1["name"], json!("dev1"));
    assert_eq!(puts[0].1["idf_list"], json!([["temp", ["float"]]]));
    assert_eq!(puts[0].1["accept_protos"], Value::Null);

    let link = connector.last_link();
    assert_eq!(
        link.calls()[0],
        Call::Subscribe {
            topic: "out/ctrl".to_string(),
            qos: Qos::ExactlyOnce
        }
    );
    assert_eq!(
        link.published("in/ctrl"),
        vec![(json!({"state": "online", "rev": 1}), Qos::ExactlyOnce, true)]
    );

    let params = connector.last_params();
    assert_eq!(params.host, "broker.local");
    assert!(params.client_id.starts_with("iottalk-rs-"));
    assert_eq!(params.last_will.topic, "in/ctrl");
    assert!(params.last_will.retain);
    let will: Value = serde_json::from_slice(&params.last_will.payload).unwrap();
    assert_eq!(will, json!({"state": "broken", "rev": 1}));
}

#[tokio::test]
async fn register_does_not_return_before_broker_confirms() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::holding();
    let client = client(&registrar, &connector);

    let registering = {
        let client = client.clone();
        tokio::spawn(async move { client.register(options(), quiet_hooks()).await })
    };

    eventually(|| connector.connects() == 1 && connector.last_link().held() == 2).await;
    assert!(!registering.is_finished());
    assert_eq!(client.state(), ConnectionState::AwaitingPresence);

    connector.last_link().release_all();
    let info = within(registering).await.unwrap().unwrap();
    assert_eq!(info.name, "dev1");
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn second_register_is_rejected_without_contacting_server() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);

    within(client.register(options(), quiet_hooks()))
        .await
        .unwrap();
    let again = within(client.register(options(), quiet_hooks())).await;

    assert_eq!(again, Err(RegistrationError::AlreadyRegistered));
    assert_eq!(registrar.put_count(), 1);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn rejected_registration_leaves_session_empty() {
    let registrar = FakeRegistrar::rejecting(403, json!({"reason": "device model not found"}));
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);

    let result = within(client.register(options(), quiet_hooks())).await;

    assert_eq!(
        result,
        Err(RegistrationError::Rejected("device model not found".to_string()))
    );
    assert_eq!(connector.connects(), 0);
    assert_eq!(client.state(), ConnectionState::Unregistered);
    assert!(client.session().await.is_none());
}

#[tokio::test]
async fn invalid_inputs_fail_before_any_request() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);

    let no_url = client.register(RegisterOptions::new(""), quiet_hooks()).await;
    assert_eq!(no_url, Err(RegistrationError::InvalidUrl));

    let bad_id = client
        .register(RegisterOptions::new("http://x").id("not-a-uuid"), quiet_hooks())
        .await;
    assert_eq!(
        bad_id,
        Err(RegistrationError::InvalidId("not-a-uuid".to_string()))
    );
    assert_eq!(registrar.put_count(), 0);
}

#[tokio::test]
async fn operations_without_session_report_not_registered() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);

    assert_eq!(
        client.push("temp", 1, PushMode::Fire).await,
        Err(RegistrationError::NotRegistered)
    );
    assert_eq!(
        client.push_produced("temp", PushMode::Fire).await,
        Err(RegistrationError::NotRegistered)
    );
    assert_eq!(
        client.deregister().await,
        Err(RegistrationError::NotRegistered)
    );
    assert!(registrar.deletes().is_empty());

    // returns immediately instead of hanging
    within(client.wait_until_deregistered()).await;
}

#[tokio::test]
async fn deregister_announces_offline_and_deletes_record() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);
    within(client.register(options(), quiet_hooks()))
        .await
        .unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_until_deregistered().await })
    };

    let response = within(client.deregister()).await.unwrap();

    assert_eq!(response, json!({"id": APP_ID}));
    let link = connector.last_link();
    let presence = link.published("in/ctrl");
    assert_eq!(
        presence.last(),
        Some(&(json!({"state": "offline", "rev": 1}), Qos::ExactlyOnce, true))
    );
    assert!(link.calls().contains(&Call::Disconnect));
    assert_eq!(
        registrar.deletes(),
        vec![(
            format!("http://iottalk.local:9992/{APP_ID}"),
            json!({"rev": 1})
        )]
    );

    assert_eq!(client.state(), ConnectionState::Unregistered);
    assert!(client.session().await.is_none());
    within(waiter).await.unwrap();
}

#[tokio::test]
async fn session_can_register_again_after_deregister() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);

    within(client.register(options(), quiet_hooks()))
        .await
        .unwrap();
    within(client.deregister()).await.unwrap();
    within(client.register(options(), quiet_hooks()))
        .await
        .unwrap();

    assert_eq!(connector.connects(), 2);
    assert_eq!(registrar.put_count(), 2);
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn events_of_a_finished_session_are_ignored() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);

    within(client.register(options(), quiet_hooks()))
        .await
        .unwrap();
    within(client.deregister()).await.unwrap();
    within(client.register(options(), quiet_hooks()))
        .await
        .unwrap();

    let old = connector.link(0);
    let current = connector.link(1);
    let old_calls = old.calls().len();
    old.send_control(json!({
        "command": "CONNECT", "msg_id": 1, "idf": "temp", "topic": "app/stale"
    }))
    .await;
    old.emit(TransportEvent::Disconnected { clean: false }).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(old.calls().len(), old_calls);
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(client.push("temp", 1, PushMode::Fire).await, Ok(false));
    assert!(current.published("app/stale").is_empty());
}

#[tokio::test]
async fn reconnect_renews_subscriptions_without_second_online() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);
    let connects = Arc::new(AtomicUsize::new(0));
    let hooks = {
        let connects = connects.clone();
        quiet_hooks().on_connect(move || {
            connects.fetch_add(1, Ordering::SeqCst);
        })
    };

    within(client.register(options(), hooks)).await.unwrap();
    let link = connector.last_link();
    link.send_control(json!({
        "command": "CONNECT", "msg_id": 1, "odf": "lamp", "topic": "app/123/lamp"
    }))
    .await;
    eventually(|| link.subscriptions("app/123/lamp") == 1).await;

    let mut state = client.state_watch();
    link.emit(TransportEvent::Disconnected { clean: false }).await;
    within(state.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .unwrap();

    link.emit(TransportEvent::Connected).await;
    within(state.wait_for(|s| *s == ConnectionState::Ready))
        .await
        .unwrap();

    assert_eq!(link.subscriptions("out/ctrl"), 2);
    assert_eq!(link.subscriptions("app/123/lamp"), 2);
    let online: Vec<_> = link
        .published("in/ctrl")
        .into_iter()
        .filter(|(payload, _, _)| payload["state"] == json!("online"))
        .collect();
    assert_eq!(online.len(), 1);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn push_produced_sends_feature_producer_value() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::new();
    let client = client(&registrar, &connector);
    let reading = Arc::new(Mutex::new(Some(json!(21.5))));

    let producer = reading.clone();
    let options = RegisterOptions::new("http://iottalk.local:9992")
        .id(APP_ID)
        .idf(
            DeviceFeature::new("temp", ["float"])
                .unwrap()
                .with_push_data(move || producer.lock().unwrap().clone()),
        );
    within(client.register(options, quiet_hooks()))
        .await
        .unwrap();
    let link = connector.last_link();
    link.send_control(json!({
        "command": "CONNECT", "msg_id": 1, "idf": "temp", "topic": "app/123/temp"
    }))
    .await;
    eventually(|| link.published("in/ctrl").len() == 2).await;

    assert_eq!(client.push_produced("temp", PushMode::Fire).await, Ok(true));
    *reading.lock().unwrap() = None;
    assert_eq!(client.push_produced("temp", PushMode::Fire).await, Ok(false));
    assert_eq!(client.push_produced("humidity", PushMode::Fire).await, Ok(false));

    assert_eq!(
        link.published("app/123/temp"),
        vec![(json!([21.5]), Qos::AtMostOnce, false)]
    );
    assert_eq!(client.status().await.messages_sent, 1);
}

#[tokio::test]
async fn timed_out_register_rolls_back_session() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::holding();
    let client = client(&registrar, &connector);

    let first = tokio::time::timeout(
        Duration::from_millis(100),
        client.register(options(), quiet_hooks()),
    )
    .await;
    assert!(first.is_err());

    let mut state = client.state_watch();
    within(state.wait_for(|s| *s == ConnectionState::Unregistered))
        .await
        .unwrap();
    assert!(connector.link(0).calls().contains(&Call::Disconnect));
    assert!(client.session().await.is_none());
    assert_eq!(
        within(client.deregister()).await,
        Err(RegistrationError::NotRegistered)
    );

    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.register(options(), quiet_hooks()).await })
    };
    eventually(|| connector.connects() == 2 && connector.link(1).held() == 2).await;
    connector.link(1).release_all();

    within(second).await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(registrar.put_count(), 2);
}

#[tokio::test]
async fn register_survives_link_loss_before_presence_is_confirmed() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::holding();
    let client = client(&registrar, &connector);

    let registering = {
        let client = client.clone();
        tokio::spawn(async move { client.register(options(), quiet_hooks()).await })
    };
    eventually(|| connector.connects() == 1 && connector.last_link().held() == 2).await;
    let link = connector.last_link();

    link.drop_held();
    link.emit(TransportEvent::Disconnected { clean: false }).await;
    link.emit(TransportEvent::Connected).await;
    eventually(|| link.held() == 2).await;
    assert!(!registering.is_finished());
    assert_eq!(client.state(), ConnectionState::AwaitingPresence);

    link.release_all();
    within(registering).await.unwrap().unwrap();

    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(link.subscriptions("out/ctrl"), 2);
}

#[tokio::test]
async fn deregister_returns_only_after_transport_reports_disconnect() {
    let registrar = FakeRegistrar::accepting();
    let connector = FakeConnector::withholding_disconnect();
    let client = client(&registrar, &connector);
    within(client.register(options(), quiet_hooks()))
        .await
        .unwrap();
    let link = connector.last_link();

    let deregistering = {
        let client = client.clone();
        tokio::spawn(async move { client.deregister().await })
    };
    eventually(|| link.calls().contains(&Call::Disconnect) && registrar.deletes().len() == 1)
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!deregistering.is_finished());
    assert_eq!(client.state(), ConnectionState::Deregistering);

    link.emit(TransportEvent::Disconnected { clean: true }).await;
    let response = within(deregistering).await.unwrap();

    assert_eq!(response, Ok(json!({"id": APP_ID})));
    assert_eq!(client.state(), ConnectionState::Unregistered);
}
