//! Tests for the call batcher

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use chainprice::batching::{
        BatchReader, BatchSettings, CallBatcher, CallOutcome, ContractCall, EncodedCall,
        QueuePhase,
    };
    use chainprice::error::CallError;
    use ethers::abi::{encode, parse_abi, Function, Token};
    use ethers::types::{Address, U256};
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Echoes each target's low bits back as a uint256 and records batches
    #[derive(Default)]
    struct RecordingReader {
        batches: Mutex<Vec<Vec<Address>>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        latency: Duration,
        broken: bool,
    }

    impl RecordingReader {
        fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Default::default()
            }
        }

        fn broken() -> Self {
            Self {
                broken: true,
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<Vec<Address>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchReader for RecordingReader {
        async fn aggregate(&self, calls: &[EncodedCall]) -> Result<Vec<CallOutcome>> {
            self.batches
                .lock()
                .unwrap()
                .push(calls.iter().map(|c| c.target).collect());
            if self.broken {
                bail!("node unreachable");
            }

            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_active, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            Ok(calls
                .iter()
                .map(|c| {
                    let n = U256::from_big_endian(c.target.as_bytes());
                    CallOutcome::ok(encode(&[Token::Uint(n)]))
                })
                .collect())
        }
    }

    fn value_fn() -> Arc<Function> {
        let abi = parse_abi(&["function value() external view returns (uint256)"]).unwrap();
        Arc::new(abi.function("value").unwrap().clone())
    }

    fn target(i: u64) -> Address {
        Address::from_low_u64_be(i)
    }

    // ============================================================================
    // Coalescing
    // ============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_requests_within_debounce_window_form_one_ordered_batch() {
        let reader = Arc::new(RecordingReader::default());
        let batcher = CallBatcher::new(BatchSettings::default())
            .unwrap()
            .with_chain(1, reader.clone())
            .unwrap();
        let function = value_fn();

        let mut handles = Vec::new();
        for i in 1..=5u64 {
            handles.push(
                batcher
                    .enqueue(1, ContractCall::new(target(i), &function, vec![]))
                    .unwrap(),
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(batcher.stats(1).unwrap().phase, QueuePhase::Accumulating);

        let results = join_all(handles).await;
        for (i, result) in (1..=5u64).zip(results) {
            assert_eq!(result, Ok(vec![Token::Uint(U256::from(i))]));
        }

        let batches = reader.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], (1..=5).map(target).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_splits_into_fifo_batches_under_concurrency_limit() {
        let reader = Arc::new(RecordingReader::with_latency(Duration::from_millis(50)));
        let settings = BatchSettings {
            max_concurrent_batches: 2,
            ..BatchSettings::default()
        };
        let batcher = CallBatcher::new(settings)
            .unwrap()
            .with_chain(1, reader.clone())
            .unwrap();
        let function = value_fn();

        let handles = batcher
            .enqueue_many(
                1,
                (1..=1200u64).map(|i| ContractCall::new(target(i), &function, vec![])),
            )
            .unwrap();
        let results = join_all(handles).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let mut batches = reader.batches();
        assert_eq!(batches.len(), 3);
        batches.sort_by_key(|b| b[0].to_low_u64_be());
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        assert_eq!(batches[1][0], target(501));
        assert_eq!(batches[2][199], target(1200));

        assert!(reader.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(batcher.stats(1).unwrap().dispatched_batches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_dispatches_without_waiting_for_debounce() {
        let reader = Arc::new(RecordingReader::default());
        let settings = BatchSettings {
            debounce: Duration::from_secs(60),
            ..BatchSettings::default()
        };
        let batcher = CallBatcher::new(settings)
            .unwrap()
            .with_chain(1, reader.clone())
            .unwrap();
        let function = value_fn();

        let handle = batcher
            .enqueue(1, ContractCall::new(target(9), &function, vec![]))
            .unwrap();
        assert_eq!(batcher.flush(1).await.unwrap(), 1);
        assert_eq!(handle.await, Ok(vec![Token::Uint(U256::from(9))]));
        assert_eq!(batcher.stats(1).unwrap().phase, QueuePhase::Idle);

        // Nothing left to flush
        assert_eq!(batcher.flush(1).await.unwrap(), 0);
        assert_eq!(reader.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_dispatches_without_waiting_for_debounce() {
        let reader = Arc::new(RecordingReader::default());
        let settings = BatchSettings {
            debounce: Duration::from_secs(3600),
            ..BatchSettings::default()
        };
        let batcher = CallBatcher::new(settings)
            .unwrap()
            .with_chain(1, reader.clone())
            .unwrap();
        let function = value_fn();
        let start = tokio::time::Instant::now();

        let handles = batcher
            .enqueue_many(
                1,
                (1..=500u64).map(|i| ContractCall::new(target(i), &function, vec![])),
            )
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let batches = reader.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 500);
        assert_eq!(batches[0][499], target(500));
        assert_eq!(start.elapsed(), Duration::ZERO);

        let stats = batcher.stats(1).unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.dispatched_batches, 1);
        assert!(join_all(handles).await.iter().all(|r| r.is_ok()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_waiting_for_a_permit_are_not_in_flight() {
        let reader = Arc::new(RecordingReader::with_latency(Duration::from_millis(50)));
        let settings = BatchSettings {
            max_batch_size: 2,
            max_concurrent_batches: 1,
            debounce: Duration::from_secs(3600),
            ..BatchSettings::default()
        };
        let batcher = CallBatcher::new(settings)
            .unwrap()
            .with_chain(1, reader.clone())
            .unwrap();
        let function = value_fn();

        let handles = batcher
            .enqueue_many(
                1,
                (1..=4u64).map(|i| ContractCall::new(target(i), &function, vec![])),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let stats = batcher.stats(1).unwrap();
        assert_eq!(stats.in_flight_batches, 1);
        assert_eq!(stats.waiting_batches, 1);
        assert_eq!(stats.phase, QueuePhase::Flushing);
        assert!(stats.is_flushing);
        assert_eq!(reader.batches().len(), 1);

        assert!(join_all(handles).await.iter().all(|r| r.is_ok()));
        assert_eq!(reader.batches().len(), 2);
        assert_eq!(reader.peak.load(Ordering::SeqCst), 1);
    }

    // ============================================================================
    // Failure isolation
    // ============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_broken_chain_does_not_affect_other_chains() {
        let broken = Arc::new(RecordingReader::broken());
        let healthy = Arc::new(RecordingReader::default());
        let batcher = CallBatcher::new(BatchSettings::default())
            .unwrap()
            .with_chain(1, broken.clone())
            .unwrap()
            .with_chain(10, healthy.clone())
            .unwrap();
        let function = value_fn();

        let on_mainnet = batcher
            .enqueue(1, ContractCall::new(target(1), &function, vec![]))
            .unwrap();
        let on_optimism = batcher
            .enqueue(10, ContractCall::new(target(2), &function, vec![]))
            .unwrap();

        assert_eq!(on_optimism.await, Ok(vec![Token::Uint(U256::from(2))]));
        match on_mainnet.await {
            Err(CallError::Transport { attempts, message }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("node unreachable"));
            }
            other => panic!("expected transport failure, got {:?}", other),
        }
        assert_eq!(broken.batches().len(), 3);
        assert_eq!(healthy.batches().len(), 1);
    }
}
