// tests/integration/manager_test.rs

//! Integration tests for connection lifecycle: connect, execute, disconnect, reconnect.

use super::fixtures::*;
use super::test_helpers::TestContext;
use boxlink::core::connection::{ConnectionStatus, ExecuteOptions, Execution};
use boxlink::core::errors::LinkError;
use boxlink::core::link::DeviceAddress;
use std::time::Duration;

// ===== getOrCreateConnection =====

#[tokio::test]
async fn test_concurrent_connects_open_one_link() {
    let ctx = TestContext::new();
    let address = ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);
    ctx.connector.set_open_delay(Duration::from_millis(20));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = ctx.manager.clone();
        let address = address.clone();
        tasks.push(tokio::spawn(async move {
            manager.get_or_create_connection(BAR_TV_1, address).await
        }));
    }
    for task in tasks {
        let link = task.await.unwrap().expect("every caller should get the link");
        assert!(link.is_alive());
    }

    assert_eq!(ctx.connector.opens(), 1);
    assert_eq!(ctx.manager.connection_count(), 1);
    let status = ctx.manager.get_connection_status(BAR_TV_1).unwrap();
    assert_eq!(status.status, ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_concurrent_connects_share_a_failed_attempt() {
    let ctx = TestContext::new();
    let address = ctx.register_unreachable(BAR_TV_1, HOST_1, CONTROL_PORT);
    ctx.connector.set_open_delay(Duration::from_millis(20));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = ctx.manager.clone();
        let address = address.clone();
        tasks.push(tokio::spawn(async move {
            manager.get_or_create_connection(BAR_TV_1, address).await
        }));
    }
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::ConnectionFailed { .. }), "got {err:?}");
    }

    assert_eq!(ctx.connector.opens(), 1);
    let status = ctx.manager.get_connection_status(BAR_TV_1).unwrap();
    assert_eq!(status.connection_attempts, 1);
}

#[tokio::test]
async fn test_failed_command_is_not_reported_as_failed_connect() {
    let ctx = TestContext::new();
    let address = ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);
    ctx.connector.set_open_delay(Duration::from_millis(50));
    ctx.connector.reject(home());

    // A connects; C's command is rejected on A's link; B waited behind both.
    let manager = ctx.manager.clone();
    let a_address = address.clone();
    let a = tokio::spawn(async move {
        manager
            .get_or_create_connection(BAR_TV_1, a_address)
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let manager = ctx.manager.clone();
    let c = tokio::spawn(async move {
        manager
            .execute_command(BAR_TV_1, home(), ExecuteOptions::queued())
            .await
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let manager = ctx.manager.clone();
    let b = tokio::spawn(async move {
        manager
            .get_or_create_connection(BAR_TV_1, address)
            .await
    });

    assert!(a.await.unwrap().is_ok());
    assert!(matches!(
        c.await.unwrap(),
        Err(LinkError::CommandFailed { .. })
    ));
    let link = b.await.unwrap().expect("B should open a fresh link");
    assert!(link.is_alive());

    assert_eq!(ctx.connector.opens(), 2);
    let status = ctx.manager.get_connection_status(BAR_TV_1).unwrap();
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.connection_attempts, 0);
}

#[tokio::test]
async fn test_connected_link_is_reused() {
    let ctx = TestContext::new();
    let address = ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);

    ctx.manager
        .get_or_create_connection(BAR_TV_1, address.clone())
        .await
        .unwrap();
    ctx.manager
        .get_or_create_connection(BAR_TV_1, address)
        .await
        .unwrap();

    assert_eq!(ctx.connector.opens(), 1);
}

#[tokio::test]
async fn test_failed_connect_records_error_and_liveness() {
    let ctx = TestContext::new();
    let address = ctx.register_unreachable(BAR_TV_1, HOST_1, CONTROL_PORT);

    let err = ctx
        .manager
        .get_or_create_connection(BAR_TV_1, address.clone())
        .await
        .unwrap_err();
    match err {
        LinkError::ConnectionFailed { device_id, reason } => {
            assert_eq!(device_id, BAR_TV_1);
            assert!(reason.contains("refused"), "reason was {reason}");
        }
        other => panic!("expected ConnectionFailed, got {other:?}"),
    }

    let status = ctx.manager.get_connection_status(BAR_TV_1).unwrap();
    assert_eq!(status.status, ConnectionStatus::Error);
    assert_eq!(status.connection_attempts, 1);
    assert!(status.last_error.is_some());
    assert!(!ctx.is_online(BAR_TV_1).await);

    // A second failure counts as another attempt.
    let _ = ctx
        .manager
        .get_or_create_connection(BAR_TV_1, address.clone())
        .await;
    assert_eq!(
        ctx.manager
            .get_connection_status(BAR_TV_1)
            .unwrap()
            .connection_attempts,
        2
    );

    // Success resets the counter and clears the error.
    ctx.connector.set_reachable(&address, true);
    ctx.manager
        .get_or_create_connection(BAR_TV_1, address)
        .await
        .unwrap();
    let status = ctx.manager.get_connection_status(BAR_TV_1).unwrap();
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.connection_attempts, 0);
    assert_eq!(status.last_error, None);
    assert!(ctx.is_online(BAR_TV_1).await);
}

#[tokio::test]
async fn test_slow_device_does_not_block_others() {
    let ctx = TestContext::new();
    let slow = ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);
    let fast = ctx.register(BAR_TV_2, HOST_2, CONTROL_PORT);

    ctx.manager
        .get_or_create_connection(BAR_TV_1, slow)
        .await
        .unwrap();
    ctx.manager
        .get_or_create_connection(BAR_TV_2, fast)
        .await
        .unwrap();

    ctx.connector.set_send_delay(Duration::from_millis(300));
    let manager = ctx.manager.clone();
    let slow_task = tokio::spawn(async move {
        manager
            .execute_command(BAR_TV_1, launch_espn(), ExecuteOptions::immediate())
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Status reads never wait on a busy device.
    let status = ctx.manager.get_connection_status(BAR_TV_1).unwrap();
    assert_eq!(status.status, ConnectionStatus::Connected);

    ctx.connector.set_send_delay(Duration::ZERO);
    let started = tokio::time::Instant::now();
    ctx.manager
        .execute_command(BAR_TV_2, home(), ExecuteOptions::immediate())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));

    slow_task.await.unwrap().unwrap();
}

// ===== executeCommand =====

#[tokio::test]
async fn test_execute_on_connected_device_runs_immediately() {
    let ctx = TestContext::new();
    let address = ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);
    ctx.manager
        .get_or_create_connection(BAR_TV_1, address)
        .await
        .unwrap();

    let execution = ctx
        .manager
        .execute_command(BAR_TV_1, volume_up(), ExecuteOptions::queued())
        .await
        .unwrap();
    assert!(!execution.is_queued());
    match execution {
        Execution::Completed(reply) => assert_eq!(reply.output, "done key"),
        Execution::Queued(_) => panic!("a connected device should not queue"),
    }
    assert_eq!(ctx.connector.sent(), vec![volume_up()]);
}

#[tokio::test]
async fn test_execute_connects_on_demand() {
    let ctx = TestContext::new();
    ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);

    let execution = ctx
        .manager
        .execute_command(BAR_TV_1, home(), ExecuteOptions::immediate())
        .await
        .unwrap();
    assert!(!execution.is_queued());
    assert_eq!(ctx.connector.opens(), 1);
    assert_eq!(ctx.connector.sent(), vec![home()]);

    let status = ctx.manager.get_connection_status(BAR_TV_1).unwrap();
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert!(ctx.is_online(BAR_TV_1).await);
}

#[tokio::test]
async fn test_execute_without_queue_on_unreachable_device() {
    let ctx = TestContext::new();
    ctx.register_unreachable(BAR_TV_1, HOST_1, CONTROL_PORT);

    let err = ctx
        .manager
        .execute_command(BAR_TV_1, home(), ExecuteOptions::immediate())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NotConnected(ref id) if id == BAR_TV_1));
    assert!(ctx.connector.sent().is_empty());
    assert_eq!(ctx.connector.opens(), 1);
    assert_eq!(
        ctx.manager
            .get_connection_status(BAR_TV_1)
            .unwrap()
            .connection_attempts,
        1
    );
}

#[tokio::test]
async fn test_concurrent_commands_share_a_failed_connect() {
    let ctx = TestContext::new();
    ctx.register_unreachable(BAR_TV_1, HOST_1, CONTROL_PORT);
    ctx.connector.set_open_delay(Duration::from_millis(20));
    // Track the device first so every caller waits on the same entry.
    let _ = ctx.manager.reconnect(BAR_TV_1).await;
    let opens_before = ctx.connector.opens();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = ctx.manager.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .execute_command(BAR_TV_1, home(), ExecuteOptions::immediate())
                .await
        }));
    }
    for task in tasks {
        assert!(matches!(
            task.await.unwrap(),
            Err(LinkError::NotConnected(_))
        ));
    }
    assert_eq!(ctx.connector.opens() - opens_before, 1);
}

#[tokio::test]
async fn test_execute_on_unknown_device() {
    let ctx = TestContext::new();

    let err = ctx
        .manager
        .execute_command("nowhere", home(), ExecuteOptions::queued())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::UnknownDevice(ref id) if id == "nowhere"));
    assert_eq!(ctx.manager.connection_count(), 0);
}

#[tokio::test]
async fn test_failed_command_forces_reconnect() {
    let ctx = TestContext::new();
    let address = ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);
    ctx.manager
        .get_or_create_connection(BAR_TV_1, address.clone())
        .await
        .unwrap();
    ctx.connector.reject(home());

    let err = ctx
        .manager
        .execute_command(BAR_TV_1, home(), ExecuteOptions::immediate())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::CommandFailed { .. }), "got {err:?}");

    let status = ctx.manager.get_connection_status(BAR_TV_1).unwrap();
    assert_eq!(status.status, ConnectionStatus::Error);
    assert!(status.last_error.unwrap().contains("rejected"));

    // No silent retry: the command reached the device exactly once.
    assert_eq!(ctx.connector.sent(), vec![home()]);

    // The next command opens a fresh link on its own.
    let execution = ctx
        .manager
        .execute_command(BAR_TV_1, volume_up(), ExecuteOptions::immediate())
        .await
        .unwrap();
    assert!(!execution.is_queued());
    assert_eq!(ctx.connector.opens(), 2);
    assert_eq!(ctx.connector.closes(), 1);
    assert_eq!(ctx.connector.sent(), vec![home(), volume_up()]);
    assert_eq!(
        ctx.manager.get_connection_status(BAR_TV_1).unwrap().status,
        ConnectionStatus::Connected
    );

    // So does an explicit connect after another failure.
    ctx.manager
        .execute_command(BAR_TV_1, home(), ExecuteOptions::immediate())
        .await
        .unwrap_err();
    ctx.manager
        .get_or_create_connection(BAR_TV_1, address)
        .await
        .unwrap();
    assert_eq!(ctx.connector.opens(), 3);
}

#[tokio::test]
async fn test_dead_link_is_replaced_on_next_command() {
    let ctx = TestContext::new();
    let address = ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);
    ctx.manager
        .get_or_create_connection(BAR_TV_1, address.clone())
        .await
        .unwrap();
    ctx.connector.kill_all_links();

    let execution = ctx
        .manager
        .execute_command(BAR_TV_1, home(), ExecuteOptions::immediate())
        .await
        .unwrap();
    assert!(!execution.is_queued());
    assert_eq!(ctx.connector.opens(), 2);
    assert_eq!(ctx.connector.closes(), 1);

    // A device that stays down afterwards is reported, not retried silently.
    ctx.connector.kill_all_links();
    ctx.connector.set_reachable(&address, false);
    let err = ctx
        .manager
        .execute_command(BAR_TV_1, home(), ExecuteOptions::immediate())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NotConnected(_)));
    assert_eq!(
        ctx.manager.get_connection_status(BAR_TV_1).unwrap().status,
        ConnectionStatus::Error
    );
}

// ===== disconnect / reconnect =====

#[tokio::test]
async fn test_disconnect_fails_queued_commands() {
    let ctx = TestContext::new();
    ctx.register_unreachable(BAR_TV_1, HOST_1, CONTROL_PORT);

    let first = ctx.queue(BAR_TV_1, launch_espn()).await;
    let second = ctx.queue(BAR_TV_1, home()).await;

    assert!(ctx.manager.disconnect(BAR_TV_1).await);

    for handle in [first, second] {
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, LinkError::ConnectionClosed(ref id) if id == BAR_TV_1));
    }
    assert!(ctx.manager.get_connection_status(BAR_TV_1).is_none());
    assert!(ctx.connector.sent().is_empty());
}

#[tokio::test]
async fn test_disconnect_closes_link_and_persists_offline() {
    let ctx = TestContext::new();
    let address = ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);
    ctx.manager
        .get_or_create_connection(BAR_TV_1, address)
        .await
        .unwrap();
    assert!(ctx.is_online(BAR_TV_1).await);

    assert!(ctx.manager.disconnect(BAR_TV_1).await);
    assert_eq!(ctx.connector.closes(), 1);
    assert!(!ctx.is_online(BAR_TV_1).await);

    // Disconnecting an untracked device is a no-op.
    assert!(!ctx.manager.disconnect(BAR_TV_1).await);
}

#[tokio::test]
async fn test_reconnect_replaces_the_link() {
    let ctx = TestContext::new();
    let address = ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);
    let first = ctx
        .manager
        .get_or_create_connection(BAR_TV_1, address)
        .await
        .unwrap();

    let second = ctx.manager.reconnect(BAR_TV_1).await.unwrap();

    assert!(!first.is_alive());
    assert!(second.is_alive());
    assert_eq!(ctx.connector.opens(), 2);
    assert_eq!(
        ctx.manager.get_connection_status(BAR_TV_1).unwrap().status,
        ConnectionStatus::Connected
    );
}

#[tokio::test]
async fn test_reconnect_untracked_device_uses_registry() {
    let ctx = TestContext::new();
    ctx.register(PATIO_TV, PATIO_HOST, CONTROL_PORT);

    ctx.manager.reconnect(PATIO_TV).await.unwrap();
    let status = ctx.manager.get_connection_status(PATIO_TV).unwrap();
    assert_eq!(status.address, DeviceAddress::new(PATIO_HOST, CONTROL_PORT));

    let err = ctx.manager.reconnect("nowhere").await.unwrap_err();
    assert!(matches!(err, LinkError::UnknownDevice(_)));
}

#[tokio::test]
async fn test_cancel_queued_command() {
    let ctx = TestContext::new();
    let address = ctx.register_unreachable(BAR_TV_1, HOST_1, CONTROL_PORT);

    let cancelled = ctx.queue(BAR_TV_1, launch_espn()).await;
    let kept = ctx.queue(BAR_TV_1, home()).await;

    assert!(ctx.manager.cancel_queued(BAR_TV_1, cancelled.id()).await);
    assert!(!ctx.manager.cancel_queued(BAR_TV_1, cancelled.id()).await);
    assert_eq!(
        ctx.manager
            .get_connection_status(BAR_TV_1)
            .unwrap()
            .queued_commands,
        1
    );

    ctx.connector.set_reachable(&address, true);
    ctx.manager
        .get_or_create_connection(BAR_TV_1, address)
        .await
        .unwrap();

    assert!(matches!(
        cancelled.wait().await,
        Err(LinkError::Cancelled(_))
    ));
    assert!(kept.wait().await.is_ok());
    assert_eq!(ctx.connector.sent(), vec![home()]);
}

#[tokio::test]
async fn test_tracked_devices_sorted() {
    let ctx = TestContext::new();
    ctx.register(PATIO_TV, PATIO_HOST, CONTROL_PORT);
    ctx.register(BAR_TV_2, HOST_2, CONTROL_PORT);
    ctx.register(BAR_TV_1, HOST_1, CONTROL_PORT);

    assert_eq!(ctx.manager.prewarm().await.unwrap().connected, 3);
    assert_eq!(
        ctx.manager.tracked_devices(),
        vec![BAR_TV_1.to_string(), BAR_TV_2.to_string(), PATIO_TV.to_string()]
    );
}
