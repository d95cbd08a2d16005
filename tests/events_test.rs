//! Notification subscriptions against the fake console.

mod common;

use std::sync::{Arc, Mutex};

use common::FakeConsole;
use xbdm_link::{Connection, ConnectionError, ConsoleEvent, ExecutionState};

fn recorder() -> (
    Arc<Mutex<Vec<ConsoleEvent>>>,
    impl Fn(&ConsoleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |event: &ConsoleEvent| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    })
}

#[tokio::test]
async fn test_subscription_receives_initial_and_live_events() {
    let console = FakeConsole::start();
    console.queue_initial_event("execution stopped");
    let conn = Connection::connect(console.config()).await.unwrap();

    let (events, handler) = recorder();
    let subscription = conn.subscribe_events(handler).await.unwrap();
    assert!(console.wait_until(|c| c.notifier_count() == 1));

    console.push_event("break addr=0x82001234 thread=0x0000000C");
    console.push_event("JRPC!ping value=1");
    assert!(console.wait_until(|_| events.lock().unwrap().len() == 3));

    let events = events.lock().unwrap().clone();
    assert_eq!(events[0], ConsoleEvent::Execution(ExecutionState::Stop));
    assert_eq!(
        events[1],
        ConsoleEvent::Break {
            address: 0x8200_1234,
            thread: 0xC
        }
    );
    assert_eq!(events[2], ConsoleEvent::External("JRPC!ping value=1".to_owned()));

    assert!(console
        .commands()
        .iter()
        .any(|c| c.starts_with("debugger connect override name=\"xbdm-link\"")));
    subscription.unsubscribe();
}

#[tokio::test]
async fn test_listener_is_shared_and_reference_counted() {
    let console = FakeConsole::start();
    let conn = Connection::connect(console.config()).await.unwrap();

    let (first_events, first_handler) = recorder();
    let (second_events, second_handler) = recorder();
    let first = conn.subscribe_events(first_handler).await.unwrap();
    let second = conn.subscribe_events(second_handler).await.unwrap();
    assert_eq!(console.count_commands("notify "), 1, "one notification channel");
    assert!(console.wait_until(|c| c.notifier_count() == 1));

    console.push_event("rip thread=0x5");
    assert!(console.wait_until(|_| {
        first_events.lock().unwrap().len() == 1 && second_events.lock().unwrap().len() == 1
    }));

    drop(first);
    console.push_event("rip thread=0x6");
    assert!(console.wait_until(|_| second_events.lock().unwrap().len() == 2));
    assert_eq!(first_events.lock().unwrap().len(), 1);

    drop(second);
    assert!(console.wait_until(|c| c.notifier_count() == 0));
}

#[tokio::test]
async fn test_failing_handler_does_not_block_others() {
    let console = FakeConsole::start();
    let conn = Connection::connect(console.config()).await.unwrap();

    let _broken = conn
        .subscribe_events(|_: &ConsoleEvent| anyhow::bail!("handler refused"))
        .await
        .unwrap();
    let (events, handler) = recorder();
    let _working = conn.subscribe_events(handler).await.unwrap();
    assert!(console.wait_until(|c| c.notifier_count() == 1));

    console.push_event("create thread=0x9 start=0x82000000");
    console.push_event("terminate thread=0x9");
    assert!(console.wait_until(|_| events.lock().unwrap().len() == 2));
    assert_eq!(events.lock().unwrap()[1], ConsoleEvent::ThreadTerminated { thread: 9 });
}

#[tokio::test]
async fn test_subscribe_on_closed_connection_fails() {
    let console = FakeConsole::start();
    let conn = Connection::connect(console.config()).await.unwrap();
    conn.close();

    let (_, handler) = recorder();
    let err = conn.subscribe_events(handler).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Closed));
}

#[tokio::test]
async fn test_closing_connection_stops_listener() {
    let console = FakeConsole::start();
    let conn = Connection::connect(console.config()).await.unwrap();
    let (_, handler) = recorder();
    let _subscription = conn.subscribe_events(handler).await.unwrap();
    assert!(console.wait_until(|c| c.notifier_count() == 1));

    conn.close();
    assert!(console.wait_until(|c| c.notifier_count() == 0));
}
