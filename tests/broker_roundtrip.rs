//! End-to-end tests for the buffer broker: two clients on separate
//! connections must observe the same underlying buffers.

use sensorhub::broker::{BrokerClient, BufferBroker, BufferRegistry};
use sensorhub::buffer::{BufferCategory, BufferName};
use sensorhub::envelope::Envelope;
use sensorhub::error::HubError;

const CREDENTIAL: &str = "secret";

/// Starts a broker on an ephemeral port and returns its address.
async fn start_broker() -> String {
    let registry = BufferRegistry::new();
    let broker = BufferBroker::bind("127.0.0.1:0", CREDENTIAL, registry)
        .await
        .expect("broker bind");
    let addr = broker.local_addr().expect("local addr").to_string();
    tokio::spawn(async move {
        let _ = broker.serve().await;
    });
    addr
}

#[tokio::test]
async fn push_from_one_client_pops_from_another() {
    let addr = start_broker().await;

    let client1 = BrokerClient::connect(addr.clone(), CREDENTIAL).await.unwrap();
    let client2 = BrokerClient::connect(addr, CREDENTIAL).await.unwrap();

    let mut writer = client1.get(BufferName::RawRx).await.unwrap();
    let mut reader = client2.get(BufferName::RawRx).await.unwrap();

    writer
        .push(Envelope::new(
            BufferCategory::Raw,
            "client1",
            b"frame1".to_vec(),
        ))
        .await
        .unwrap();

    let envelope = reader.pop().await.unwrap();
    assert_eq!(envelope.payload, b"frame1");
    assert_eq!(envelope.origin, "client1");

    // Exactly once: the buffer is empty again.
    assert_eq!(reader.len().await.unwrap(), 0);
}

#[tokio::test]
async fn fifo_order_survives_the_wire() {
    let addr = start_broker().await;
    let client = BrokerClient::connect(addr, CREDENTIAL).await.unwrap();

    let mut handle = client.get(BufferName::MqttRx).await.unwrap();
    for i in 0..5u8 {
        handle
            .push(Envelope::new(BufferCategory::Pubsub, "producer", vec![i]))
            .await
            .unwrap();
    }
    assert_eq!(handle.len().await.unwrap(), 5);
    for i in 0..5u8 {
        assert_eq!(handle.pop().await.unwrap().payload, vec![i]);
    }
}

#[tokio::test]
async fn buffers_are_independent() {
    let addr = start_broker().await;
    let client = BrokerClient::connect(addr, CREDENTIAL).await.unwrap();

    let mut raw_rx = client.get(BufferName::RawRx).await.unwrap();
    let mut raw_tx = client.get(BufferName::RawTx).await.unwrap();

    raw_rx
        .push(Envelope::new(BufferCategory::Raw, "x", b"rx-only".to_vec()))
        .await
        .unwrap();
    assert_eq!(raw_rx.len().await.unwrap(), 1);
    // RawTx must never see RawRx traffic.
    assert_eq!(raw_tx.len().await.unwrap(), 0);
}

#[tokio::test]
async fn blocked_pop_completes_when_item_arrives() {
    let addr = start_broker().await;
    let client = BrokerClient::connect(addr.clone(), CREDENTIAL).await.unwrap();

    let mut reader = client.get(BufferName::MqttRx).await.unwrap();
    let popper = tokio::spawn(async move { reader.pop().await });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!popper.is_finished(), "pop should park on the empty buffer");

    let mut writer = client.get(BufferName::MqttRx).await.unwrap();
    writer
        .push(Envelope::new(BufferCategory::Pubsub, "late", b"m".to_vec()))
        .await
        .unwrap();

    let envelope = popper.await.unwrap().unwrap();
    assert_eq!(envelope.origin, "late");
}

#[tokio::test]
async fn wrong_credential_is_denied_but_broker_survives() {
    let addr = start_broker().await;

    let denied = BrokerClient::connect(addr.clone(), "wrong-secret").await;
    assert!(matches!(denied, Err(HubError::AuthenticationFailed)));

    // The broker keeps serving properly authenticated clients.
    let client = BrokerClient::connect(addr, CREDENTIAL).await.unwrap();
    client.health_check().await.unwrap();
}

#[tokio::test]
async fn health_check_answers_pong() {
    let addr = start_broker().await;
    let client = BrokerClient::connect(addr, CREDENTIAL).await.unwrap();
    client.health_check().await.unwrap();
    client.health_check().await.unwrap();
}
