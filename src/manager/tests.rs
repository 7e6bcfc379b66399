use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::pins::private_context_key;
use crate::store::{MemoryStore, MockDataResolver};
use crate::test_utils::{
    AUTHOR, FaultyStore, RecordingDispatcher, broadcast, eventually, group, next_dispatch,
    options, private,
};
use crate::types::{Bytes32, Data, Offset, OffsetType, MSG_BATCH_OFFSET_NAME, SYSTEM_NAMESPACE};

fn test_config() -> Config {
    let mut config = Config::default();
    config.manager.read_page_size = 50;
    config.manager.message_poll_timeout_ms = 20;
    config.manager.startup_retry_attempts = 3;
    config.retry.initial_delay_ms = 1;
    config.retry.maximum_delay_ms = 5;
    config
}

fn manager_over(store: Arc<dyn Store>, resolver: Arc<dyn DataResolver>) -> BatchManager {
    BatchManager::builder(test_config())
        .with_store(store)
        .with_data_resolver(resolver)
        .build()
        .unwrap()
}

fn memory_manager(store: &MemoryStore) -> BatchManager {
    manager_over(Arc::new(store.clone()), Arc::new(store.clone()))
}

async fn shutdown(manager: BatchManager) {
    manager.close();
    manager.wait_stopped().await;
}

#[tokio::test]
async fn build_requires_store_and_resolver() {
    let store = MemoryStore::new();
    let missing_store = BatchManager::builder(test_config())
        .with_data_resolver(Arc::new(store.clone()))
        .build();
    assert!(matches!(missing_store, Err(BatchError::MissingDependency("store"))));

    let missing_resolver = BatchManager::builder(test_config())
        .with_store(Arc::new(store))
        .build();
    assert!(matches!(
        missing_resolver,
        Err(BatchError::MissingDependency("data resolver"))
    ));
}

#[tokio::test]
async fn broadcast_batch_end_to_end() {
    let store = MemoryStore::new();
    let mut manager = memory_manager(&store);
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    manager
        .register_dispatcher(
            &[MessageType::Broadcast, MessageType::Definition],
            dispatcher,
            options(2, 60_000, 60_000),
        )
        .unwrap();
    manager.start().await.unwrap();

    let data = Data::new(serde_json::json!({"hello": "world"}));
    store.insert_data(data.clone()).await;
    let first = broadcast(&["topic1"]).with_data(&data);
    let second = broadcast(&["topic2", "topic1"]);
    manager.notify_new_message(store.insert_message(first.clone()).await);
    manager.notify_new_message(store.insert_message(second.clone()).await);

    let got = next_dispatch(&mut dispatched).await;
    assert_eq!(got.batch.message_ids(), vec![first.id(), second.id()]);
    assert_eq!(got.batch.payload.data, vec![data]);
    let contexts: Vec<String> = got.contexts.iter().map(|c| c.to_string()).collect();
    assert_eq!(
        contexts,
        vec![
            "9e065a7cbddfc57be742bc32956674c3c389521ac2bbb1dce0500d5131fede75",
            "bac6f86b850df0ff7e07d0ce1cb1181fc13627f4287d87237ee2c4d658220896",
        ]
    );

    let mut watcher = manager.offset_watcher();
    tokio::time::timeout(Duration::from_secs(5), watcher.wait_for(|o| *o == 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manager.current_offset(), 2);

    let stored = store.batch(&got.batch.id).await.unwrap();
    assert!(stored.confirmed.is_some());
    assert_eq!(stored.hash, got.batch.hash);
    shutdown(manager).await;
}

#[tokio::test]
async fn private_batch_end_to_end() {
    let store = MemoryStore::new();
    let g = group();
    store
        .set_nonce(Bytes32::sha256(private_context_key("topic1", &g)), AUTHOR, 12345)
        .await;
    store
        .set_nonce(Bytes32::sha256(private_context_key("topic2", &g)), AUTHOR, 12346)
        .await;

    let mut manager = memory_manager(&store);
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    manager
        .register_dispatcher(
            &[MessageType::Private, MessageType::GroupInit, MessageType::TransferPrivate],
            dispatcher,
            options(1, 500, 60_000),
        )
        .unwrap();
    manager.start().await.unwrap();

    let msg = private(&["topic1", "topic2"]);
    manager.notify_new_message(store.insert_message(msg.clone()).await);

    let got = next_dispatch(&mut dispatched).await;
    assert_eq!(got.batch.group, Some(g));
    let contexts: Vec<String> = got.contexts.iter().map(|c| c.to_string()).collect();
    assert_eq!(
        contexts,
        vec![
            "67d5df5dfe39874891362dca277d21a7d331c43be4fa006fe5f338cc875394fa",
            "4837a2ed83e4a3f08469874de218831ab9e2036c9c0cfd045f61205969ad694b",
        ]
    );
    shutdown(manager).await;
}

#[tokio::test]
async fn start_resumes_from_existing_offset() {
    let store = FaultyStore::new(MemoryStore::new());
    store
        .inner()
        .upsert_offset(
            &Offset {
                offset_type: OffsetType::Batch,
                namespace: SYSTEM_NAMESPACE.to_string(),
                name: MSG_BATCH_OFFSET_NAME.to_string(),
                current: 12345,
            },
            false,
        )
        .await
        .unwrap();

    let mut manager = manager_over(store.clone(), Arc::new(store.inner().clone()));
    manager.start().await.unwrap();
    assert_eq!(manager.current_offset(), 12345);

    let observer = store.clone();
    eventually("first page read", || {
        let observer = observer.clone();
        async move { !observer.filters().is_empty() }
    })
    .await;
    assert_eq!(store.filters()[0].after_sequence, 12345);
    assert_eq!(store.count("upsert_offset"), 0);
    shutdown(manager).await;
}

#[tokio::test]
async fn start_fails_when_offset_cannot_be_restored() {
    let store = FaultyStore::new(MemoryStore::new());
    store.fail("get_offset", u32::MAX);
    let mut manager = manager_over(store.clone(), Arc::new(MockDataResolver::new()));

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, BatchError::Store(_)));
    assert_eq!(store.count("get_offset"), 3);
    assert_eq!(store.count("get_messages"), 0);
    assert_eq!(manager.active_processors(), 0);
}

#[tokio::test]
async fn registration_is_closed_after_start() {
    let store = MemoryStore::new();
    let mut manager = memory_manager(&store);
    let (dispatcher, _) = RecordingDispatcher::new();
    manager
        .register_dispatcher(&[MessageType::Broadcast], dispatcher.clone(), options(1, 1, 1))
        .unwrap();
    let duplicate = manager.register_dispatcher(
        &[MessageType::Broadcast],
        dispatcher.clone(),
        options(1, 1, 1),
    );
    assert!(matches!(
        duplicate,
        Err(BatchError::DuplicateDispatcher(MessageType::Broadcast))
    ));

    manager.start().await.unwrap();
    assert!(matches!(manager.start().await, Err(BatchError::AlreadyStarted)));
    let late = manager.register_dispatcher(&[MessageType::Private], dispatcher, options(1, 1, 1));
    assert!(matches!(late, Err(BatchError::AlreadyStarted)));
    shutdown(manager).await;
}

#[tokio::test]
async fn idle_processors_are_disposed() {
    let store = MemoryStore::new();
    let mut manager = memory_manager(&store);
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    manager
        .register_dispatcher(&[MessageType::Broadcast], dispatcher, options(1, 500, 0))
        .unwrap();
    manager.start().await.unwrap();

    for ns in ["ns1", "ns2"] {
        let mut msg = broadcast(&["t"]);
        msg.header.namespace = ns.to_string();
        manager.notify_new_message(store.insert_message(msg).await);
    }
    next_dispatch(&mut dispatched).await;
    next_dispatch(&mut dispatched).await;

    let manager = Arc::new(manager);
    let observer = manager.clone();
    eventually("processor disposal", || {
        let observer = observer.clone();
        async move { observer.active_processors() == 0 }
    })
    .await;
    manager.close();
    manager.wait_stopped().await;
}

#[tokio::test]
async fn batches_follow_sequence_order() {
    let store = MemoryStore::new();
    let mut manager = memory_manager(&store);
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    manager
        .register_dispatcher(&[MessageType::Broadcast], dispatcher, options(3, 60_000, 60_000))
        .unwrap();

    let mut expected = Vec::new();
    for _ in 0..9 {
        let msg = broadcast(&["t"]);
        expected.push(msg.id());
        store.insert_message(msg).await;
    }
    manager.start().await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let got = next_dispatch(&mut dispatched).await;
        assert_eq!(got.batch.payload.messages.len(), 3);
        seen.extend(got.batch.message_ids());
    }
    assert_eq!(seen, expected);
    shutdown(manager).await;
}

#[tokio::test]
async fn unsealed_messages_are_redelivered_after_restart() {
    let store = MemoryStore::new();
    let msg = broadcast(&["t"]);
    store.insert_message(msg.clone()).await;

    // first run: the batch never seals before shutdown
    let mut first = memory_manager(&store);
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    first
        .register_dispatcher(&[MessageType::Broadcast], dispatcher, options(10, 60_000, 60_000))
        .unwrap();
    first.start().await.unwrap();
    let observer = store.clone();
    eventually("message recorded in open batch", || {
        let observer = observer.clone();
        let id = msg.id();
        async move { observer.message(&id).await.is_some_and(|m| m.batch.is_some()) }
    })
    .await;
    shutdown(first).await;
    assert!(dispatched.try_recv().is_err());

    let stored = store
        .get_offset(OffsetType::Batch, SYSTEM_NAMESPACE, MSG_BATCH_OFFSET_NAME)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.current, 0);

    let mut second = memory_manager(&store);
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    second
        .register_dispatcher(&[MessageType::Broadcast], dispatcher, options(1, 500, 60_000))
        .unwrap();
    second.start().await.unwrap();
    let got = next_dispatch(&mut dispatched).await;
    assert_eq!(got.batch.message_ids(), vec![msg.id()]);

    let mut watcher = second.offset_watcher();
    tokio::time::timeout(Duration::from_secs(5), watcher.wait_for(|o| *o == 1))
        .await
        .unwrap()
        .unwrap();
    shutdown(second).await;
}

#[tokio::test]
async fn close_stops_background_tasks() {
    let store = MemoryStore::new();
    let mut manager = memory_manager(&store);
    manager.start().await.unwrap();
    manager.close();
    tokio::time::timeout(Duration::from_secs(5), manager.wait_stopped())
        .await
        .unwrap();
    // notifications after close are dropped without blocking
    manager.notify_new_message(1);
}
