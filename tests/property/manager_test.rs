// tests/property/manager_test.rs

//! Property-based tests for the connection manager
//! Tests that concurrent callers share one link and that replay keeps submission order

use crate::test_helpers::TestContext;
use boxlink::core::link::DeviceCommand;
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 20, // Each case spins up a runtime
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_concurrent_callers_open_one_link(callers in 2usize..=24, delay_ms in 0u64..=10) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = TestContext::new();
            let address = ctx.register("tv", "10.1.0.1", 5555);
            ctx.connector.set_open_delay(Duration::from_millis(delay_ms));

            let mut tasks = Vec::new();
            for _ in 0..callers {
                let manager = ctx.manager.clone();
                let address = address.clone();
                tasks.push(tokio::spawn(async move {
                    manager.get_or_create_connection("tv", address).await
                }));
            }
            for task in tasks {
                assert!(task.await.unwrap().is_ok());
            }
            assert_eq!(ctx.connector.opens(), 1);
        });
    }

    #[test]
    fn test_replay_matches_submission_order(
        texts in prop::collection::vec("[a-z ]{1,12}", 1..=20)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = TestContext::new();
            let address = ctx.register_unreachable("tv", "10.1.0.1", 5555);

            let commands: Vec<DeviceCommand> = texts
                .iter()
                .map(|text| DeviceCommand::InputText { text: text.clone() })
                .collect();
            let mut handles = Vec::new();
            for command in &commands {
                handles.push(ctx.queue("tv", command.clone()).await);
            }

            ctx.connector.set_reachable(&address, true);
            ctx.manager.get_or_create_connection("tv", address).await.unwrap();

            assert_eq!(ctx.connector.sent(), commands);
            for handle in handles {
                assert!(handle.wait().await.is_ok());
            }
        });
    }
}
