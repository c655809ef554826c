use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chat_relay::{
    message::{Message, SYSTEM_SENDER},
    relay::{Relay, RelayError},
};
use tokio::time::{sleep, timeout};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);
const SETTLE: Duration = Duration::from_millis(50);

fn texts(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|message| message.text.as_str()).collect()
}

#[tokio::test]
async fn registration_snapshot_is_the_prefix_of_prior_broadcasts() -> Result<()> {
    let relay = Relay::new();

    let history = relay.register("alice").await?;
    assert!(history.is_empty());

    let history = relay.register("bob").await?;
    assert_eq!(texts(&history), ["User alice joined"]);

    relay.send("alice", "one").await?;
    relay.send("alice", "two").await?;

    let history = relay.register("carol").await?;
    assert_eq!(
        texts(&history),
        ["User alice joined", "User bob joined", "one", "two"]
    );
    Ok(())
}

#[tokio::test]
async fn senders_never_hear_their_own_messages() -> Result<()> {
    let relay = Relay::new();
    relay.register("alice").await?;
    relay.register("bob").await?;

    // Alice's only pending delivery is bob's join notice, not her own.
    let notice = timeout(RESOLVE_TIMEOUT, relay.poll("alice")).await??;
    assert_eq!(notice.text, "User bob joined");

    relay.send("alice", "hi bob").await?;

    // Bob's first delivery is alice's message, not his own join notice.
    let received = timeout(RESOLVE_TIMEOUT, relay.poll("bob")).await??;
    assert_eq!(received.from, "alice");
    assert_eq!(received.text, "hi bob");

    let echo = timeout(Duration::from_millis(200), relay.poll("alice")).await;
    assert!(echo.is_err(), "alice must not receive her own message");
    Ok(())
}

#[tokio::test]
async fn messages_arrive_in_send_order() -> Result<()> {
    let relay = Relay::new();
    relay.register("alice").await?;
    relay.register("bob").await?;

    for n in 1..=5 {
        relay.send("alice", &format!("msg-{n}")).await?;
    }

    for n in 1..=5 {
        let received = timeout(RESOLVE_TIMEOUT, relay.poll("bob")).await??;
        assert_eq!(received.text, format!("msg-{n}"));
    }
    Ok(())
}

#[tokio::test]
async fn unregister_releases_a_pending_poll() -> Result<()> {
    let relay = Arc::new(Relay::new());
    relay.register("alice").await?;

    let poller = {
        let relay = Arc::clone(&relay);
        tokio::spawn(async move { relay.poll("alice").await })
    };
    sleep(SETTLE).await;
    assert!(!poller.is_finished(), "poll should block while the queue is empty");

    assert!(relay.unregister("alice").await);

    let outcome = timeout(RESOLVE_TIMEOUT, poller)
        .await
        .expect("poll should resolve after unregister")
        .expect("poll task should not panic");
    assert_eq!(outcome, Err(RelayError::ClientGone));
    Ok(())
}

#[tokio::test]
async fn reregistration_supersedes_the_old_queue() -> Result<()> {
    let relay = Arc::new(Relay::new());
    relay.register("alice").await?;

    let stale_poller = {
        let relay = Arc::clone(&relay);
        tokio::spawn(async move { relay.poll("alice").await })
    };
    sleep(SETTLE).await;

    // Same id registers again: the old queue must wake with ClientGone.
    relay.register("alice").await?;
    let outcome = timeout(RESOLVE_TIMEOUT, stale_poller)
        .await
        .expect("stale poll should resolve after supersession")
        .expect("poll task should not panic");
    assert_eq!(outcome, Err(RelayError::ClientGone));

    // The replacement queue is live and receives subsequent broadcasts.
    relay.register("bob").await?;
    let received = timeout(RESOLVE_TIMEOUT, relay.poll("alice")).await??;
    assert_eq!(received.from, SYSTEM_SENDER);
    assert_eq!(received.text, "User bob joined");
    Ok(())
}

#[tokio::test]
async fn full_queue_drops_oldest_without_reordering_survivors() -> Result<()> {
    let relay = Relay::with_queue_capacity(3);
    relay.register("alice").await?;
    relay.register("bob").await?;

    for n in 1..=5 {
        relay.send("alice", &format!("msg-{n}")).await?;
    }

    // Capacity 3: msg-1 and msg-2 were evicted, the rest stay in order.
    for n in 3..=5 {
        let received = timeout(RESOLVE_TIMEOUT, relay.poll("bob")).await??;
        assert_eq!(received.text, format!("msg-{n}"));
    }
    let empty = timeout(Duration::from_millis(200), relay.poll("bob")).await;
    assert!(empty.is_err(), "evicted messages must never reappear");
    Ok(())
}

#[tokio::test]
async fn concurrent_sends_keep_per_sender_order() -> Result<()> {
    let relay = Arc::new(Relay::with_queue_capacity(256));
    relay.register("watcher").await?;

    let sender = |name: &'static str| {
        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            for n in 0..50 {
                relay.send(name, &format!("{name}-{n}")).await.unwrap();
            }
        })
    };
    let left = sender("left");
    let right = sender("right");
    left.await?;
    right.await?;

    let mut from_left = Vec::new();
    let mut from_right = Vec::new();
    for _ in 0..100 {
        let received = timeout(RESOLVE_TIMEOUT, relay.poll("watcher")).await??;
        match received.from.as_str() {
            "left" => from_left.push(received.text),
            "right" => from_right.push(received.text),
            other => panic!("unexpected sender {other}"),
        }
    }

    let expected = |name: &str| -> Vec<String> {
        (0..50).map(|n| format!("{name}-{n}")).collect()
    };
    assert_eq!(from_left, expected("left"));
    assert_eq!(from_right, expected("right"));
    Ok(())
}

#[tokio::test]
async fn simultaneous_registrations_of_one_id_leave_one_queue() -> Result<()> {
    let relay = Arc::new(Relay::new());

    let mut joins = Vec::new();
    for _ in 0..10 {
        let relay = Arc::clone(&relay);
        joins.push(tokio::spawn(async move { relay.register("dup").await }));
    }
    for join in joins {
        join.await?.expect("registration should succeed");
    }

    assert_eq!(relay.client_count().await, 1);
    assert!(relay.unregister("dup").await);
    assert!(!relay.unregister("dup").await);
    Ok(())
}

#[tokio::test]
async fn close_all_releases_every_pending_poll() -> Result<()> {
    let relay = Arc::new(Relay::new());
    relay.register("alice").await?;
    relay.register("bob").await?;

    // Drain bob's join notice from alice's queue so both polls below block.
    let backlog = timeout(RESOLVE_TIMEOUT, relay.poll("alice")).await??;
    assert_eq!(backlog.text, "User bob joined");

    let pollers: Vec<_> = ["alice", "bob"]
        .into_iter()
        .map(|id| {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.poll(id).await })
        })
        .collect();
    sleep(SETTLE).await;

    relay.close_all().await;

    for poller in pollers {
        let outcome = timeout(RESOLVE_TIMEOUT, poller)
            .await
            .expect("poll should resolve after close_all")
            .expect("poll task should not panic");
        assert_eq!(outcome, Err(RelayError::ClientGone));
    }
    assert_eq!(relay.client_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn alice_and_bob_end_to_end_trace() -> Result<()> {
    let relay = Arc::new(Relay::new());

    let history = relay.register("alice").await?;
    assert!(history.is_empty());

    let history = relay.register("bob").await?;
    assert_eq!(texts(&history), ["User alice joined"]);

    // Alice is told about bob's arrival; bob never sees his own join.
    let notice = timeout(RESOLVE_TIMEOUT, relay.poll("alice")).await??;
    assert_eq!(notice.from, SYSTEM_SENDER);
    assert_eq!(notice.text, "User bob joined");

    relay.send("alice", "hi").await?;
    let received = timeout(RESOLVE_TIMEOUT, relay.poll("bob")).await??;
    assert_eq!(received.from, "alice");
    assert_eq!(received.text, "hi");
    let echo = timeout(Duration::from_millis(200), relay.poll("alice")).await;
    assert!(echo.is_err(), "alice's queue must not hold her own message");

    let pending = {
        let relay = Arc::clone(&relay);
        tokio::spawn(async move { relay.poll("alice").await })
    };
    sleep(SETTLE).await;

    assert!(relay.unregister("alice").await);
    let outcome = timeout(RESOLVE_TIMEOUT, pending)
        .await
        .expect("pending poll should resolve")
        .expect("poll task should not panic");
    assert_eq!(outcome, Err(RelayError::ClientGone));

    assert!(!relay.unregister("alice").await);
    assert_eq!(
        relay.poll("alice").await,
        Err(RelayError::NotRegistered("alice".to_string()))
    );
    Ok(())
}
