//! Contract call batching layer
//!
//! Coalesces independently issued on-chain reads into multicall batches.
//! Every chain owns a FIFO queue: a full queue (`max_batch_size`) is flushed
//! immediately, a partial one after a short debounce window that is rearmed on
//! each enqueue. Batches run behind a per-chain semaphore and a failed
//! round trip is retried as a whole with exponential backoff. Items inside a
//! successful round trip complete independently of each other.

pub mod abi;
mod multicall;
mod reader;

pub use multicall::{
    decode_try_aggregate, encode_try_aggregate, Multicall3Reader, MULTICALL3_ADDRESS,
};
pub use reader::{BatchReader, CallOutcome, ContractCall, EncodedCall};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use ethers::abi::Token;
use futures_util::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::BatchingConfig;
use crate::error::{CallError, PricingError, PricingResult};
use crate::types::Chain;

/// Result delivered to a completion handle: the decoded return values.
pub type CallResult = Result<Vec<Token>, CallError>;

/// Batching parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub debounce: Duration,
    pub max_concurrent_batches: usize,
    /// Total attempts for one batch, including the first
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            debounce: Duration::from_millis(10),
            max_concurrent_batches: 10,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl BatchSettings {
    fn validate(&self) -> PricingResult<()> {
        if self.max_batch_size == 0 {
            return Err(PricingError::Config("max_batch_size must be > 0".into()));
        }
        if self.max_concurrent_batches == 0 {
            return Err(PricingError::Config(
                "max_concurrent_batches must be > 0".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(PricingError::Config("max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

impl From<&BatchingConfig> for BatchSettings {
    fn from(cfg: &BatchingConfig) -> Self {
        Self {
            max_batch_size: cfg.max_batch_size.max(1),
            debounce: Duration::from_millis(cfg.debounce_ms),
            max_concurrent_batches: cfg.max_concurrent_batches.max(1),
            max_attempts: cfg.max_attempts.max(1),
            retry_base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
        }
    }
}

/// Completion handle for one queued read. Resolves exactly once.
#[derive(Debug)]
pub struct CallHandle {
    rx: oneshot::Receiver<CallResult>,
}

impl Future for CallHandle {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(CallError::Dropped)))
    }
}

/// Where a chain queue currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Idle,
    /// Requests pending, debounce timer armed
    Accumulating,
    /// At least one batch dispatched and not yet completed, including
    /// batches still waiting for a concurrency permit
    Flushing,
}

/// Per-chain queue statistics for observability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub phase: QueuePhase,
    pub pending: usize,
    /// Batches holding a concurrency permit
    pub in_flight_batches: usize,
    /// Batches dispatched but waiting for a permit
    pub waiting_batches: usize,
    pub is_flushing: bool,
    pub dispatched_batches: u64,
    pub last_dispatch_at: Option<DateTime<Utc>>,
}

struct QueuedCall {
    call: ContractCall,
    encoded: EncodedCall,
    reply: oneshot::Sender<CallResult>,
}

impl QueuedCall {
    fn new(call: ContractCall) -> PricingResult<(Self, CallHandle)> {
        let encoded = call.encode()?;
        let (reply, rx) = oneshot::channel();
        Ok((
            Self {
                call,
                encoded,
                reply,
            },
            CallHandle { rx },
        ))
    }

    fn complete(self, outcome: CallOutcome) {
        let target = self.call.target;
        let result = if outcome.success {
            self.call
                .function
                .decode_output(&outcome.return_data)
                .map_err(|e| CallError::Decode {
                    target,
                    message: e.to_string(),
                })
        } else {
            Err(CallError::Reverted {
                target,
                data: hex::encode(&outcome.return_data),
            })
        };
        // The caller may have stopped waiting; that is not our concern.
        let _ = self.reply.send(result);
    }

    fn fail(self, err: CallError) {
        let _ = self.reply.send(Err(err));
    }
}

#[derive(Default)]
struct LaneState {
    pending: VecDeque<QueuedCall>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is rearmed or cancelled
    timer_generation: u64,
    dispatched_batches: u64,
    last_dispatch_at: Option<DateTime<Utc>>,
}

impl LaneState {
    fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Pop the next batch of at most `max` calls in FIFO order
    fn take_batch(&mut self, max: usize) -> Vec<QueuedCall> {
        let n = self.pending.len().min(max);
        self.dispatched_batches += 1;
        self.last_dispatch_at = Some(Utc::now());
        self.pending.drain(..n).collect()
    }

    fn take_all(&mut self, max: usize) -> Vec<Vec<QueuedCall>> {
        let mut batches = Vec::new();
        while !self.pending.is_empty() {
            batches.push(self.take_batch(max));
        }
        batches
    }
}

/// Queue, limiter and transport for one chain
struct ChainLane {
    chain_id: u64,
    reader: Arc<dyn BatchReader>,
    settings: BatchSettings,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
    state: Mutex<LaneState>,
}

impl ChainLane {
    fn state(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the queue; full batches are dispatched right away, otherwise
    /// the debounce timer is rearmed.
    fn push(self: &Arc<Self>, calls: Vec<QueuedCall>) {
        let max = self.settings.max_batch_size;
        let mut ready = Vec::new();
        {
            let mut state = self.state();
            for call in calls {
                state.pending.push_back(call);
                if state.pending.len() >= max {
                    ready.push(state.take_batch(max));
                }
            }

            state.cancel_timer();
            if !state.pending.is_empty() {
                let generation = state.timer_generation;
                state.timer = Some(self.arm_timer(generation));
            }
        }

        for batch in ready {
            self.dispatch(batch);
        }
    }

    fn arm_timer(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let lane = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(lane.settings.debounce).await;
            let batches = {
                let mut state = lane.state();
                if state.timer_generation != generation {
                    // Superseded by a newer enqueue or an explicit flush
                    return;
                }
                state.timer = None;
                state.take_all(lane.settings.max_batch_size)
            };
            for batch in batches {
                lane.dispatch(batch);
            }
        })
    }

    /// Cancel the timer and dispatch everything pending
    fn drain_now(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let batches = {
            let mut state = self.state();
            state.cancel_timer();
            state.take_all(self.settings.max_batch_size)
        };
        batches.into_iter().map(|batch| self.dispatch(batch)).collect()
    }

    fn dispatch(self: &Arc<Self>, batch: Vec<QueuedCall>) -> JoinHandle<()> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let lane = Arc::clone(self);
        tokio::spawn(async move {
            lane.run_batch(batch).await;
        })
    }

    async fn run_batch(&self, batch: Vec<QueuedCall>) {
        let acquired = Arc::clone(&self.permits).acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        let _permit = match acquired {
            Ok(permit) => permit,
            Err(_) => {
                for queued in batch {
                    queued.fail(CallError::Dropped);
                }
                return;
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.submit_batch(batch).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn submit_batch(&self, batch: Vec<QueuedCall>) {
        let calls: Vec<EncodedCall> = batch.iter().map(|q| q.encoded.clone()).collect();
        match self.submit_with_retry(&calls).await {
            Ok(outcomes) => {
                for (queued, outcome) in batch.into_iter().zip(outcomes) {
                    queued.complete(outcome);
                }
            }
            Err(err) => {
                for queued in batch {
                    queued.fail(err.clone());
                }
            }
        }
    }

    async fn submit_with_retry(&self, calls: &[EncodedCall]) -> Result<Vec<CallOutcome>, CallError> {
        let mut delay = self.settings.retry_base_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.reader.aggregate(calls).await {
                Ok(outcomes) if outcomes.len() == calls.len() => {
                    debug!(
                        chain_id = self.chain_id,
                        batch_size = calls.len(),
                        attempt,
                        "Batch completed"
                    );
                    return Ok(outcomes);
                }
                Ok(outcomes) => anyhow!(
                    "reader returned {} results for {} calls",
                    outcomes.len(),
                    calls.len()
                ),
                Err(e) => e,
            };

            if attempt >= self.settings.max_attempts {
                error!(
                    chain_id = self.chain_id,
                    batch_size = calls.len(),
                    attempts = attempt,
                    error = %err,
                    "❌ Batch failed, giving up"
                );
                return Err(CallError::Transport {
                    attempts: attempt,
                    message: format!("{:#}", err),
                });
            }

            warn!(
                chain_id = self.chain_id,
                batch_size = calls.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Batch transport failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    fn stats(&self) -> QueueStats {
        let state = self.state();
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        let waiting = self.waiting.load(Ordering::SeqCst);
        let busy = in_flight + waiting > 0;
        let phase = if busy {
            QueuePhase::Flushing
        } else if state.timer.is_some() {
            QueuePhase::Accumulating
        } else {
            QueuePhase::Idle
        };
        QueueStats {
            phase,
            pending: state.pending.len(),
            in_flight_batches: in_flight,
            waiting_batches: waiting,
            is_flushing: busy,
            dispatched_batches: state.dispatched_batches,
            last_dispatch_at: state.last_dispatch_at,
        }
    }
}

impl Drop for ChainLane {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_timer();
        for queued in state.pending.drain(..) {
            queued.fail(CallError::Dropped);
        }
    }
}

/// Multi-chain call batcher. Must be used from within a tokio runtime.
pub struct CallBatcher {
    settings: BatchSettings,
    lanes: HashMap<u64, Arc<ChainLane>>,
}

impl CallBatcher {
    pub fn new(settings: BatchSettings) -> PricingResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            lanes: HashMap::new(),
        })
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Attach the batched-read transport for a chain
    pub fn register_chain(
        &mut self,
        chain_id: u64,
        reader: Arc<dyn BatchReader>,
    ) -> PricingResult<()> {
        Chain::require(chain_id)?;
        let lane = ChainLane {
            chain_id,
            reader,
            settings: self.settings,
            permits: Arc::new(Semaphore::new(self.settings.max_concurrent_batches)),
            waiting: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            state: Mutex::new(LaneState::default()),
        };
        self.lanes.insert(chain_id, Arc::new(lane));
        Ok(())
    }

    pub fn with_chain(mut self, chain_id: u64, reader: Arc<dyn BatchReader>) -> PricingResult<Self> {
        self.register_chain(chain_id, reader)?;
        Ok(self)
    }

    pub fn supports_chain(&self, chain_id: u64) -> bool {
        self.lanes.contains_key(&chain_id)
    }

    fn lane(&self, chain_id: u64) -> PricingResult<&Arc<ChainLane>> {
        Chain::require(chain_id)?;
        self.lanes
            .get(&chain_id)
            .ok_or(PricingError::NoReader(chain_id))
    }

    /// Queue one read and get its completion handle
    pub fn enqueue(&self, chain_id: u64, call: ContractCall) -> PricingResult<CallHandle> {
        let lane = self.lane(chain_id)?;
        let (queued, handle) = QueuedCall::new(call)?;
        lane.push(vec![queued]);
        Ok(handle)
    }

    /// Queue several reads; handles are returned in the same order.
    ///
    /// All calls are encoded before any is queued, so an encoding error
    /// leaves the queue untouched.
    pub fn enqueue_many(
        &self,
        chain_id: u64,
        calls: impl IntoIterator<Item = ContractCall>,
    ) -> PricingResult<Vec<CallHandle>> {
        let lane = self.lane(chain_id)?;

        let mut queued = Vec::new();
        let mut handles = Vec::new();
        for call in calls {
            let (entry, handle) = QueuedCall::new(call)?;
            queued.push(entry);
            handles.push(handle);
        }

        if !queued.is_empty() {
            lane.push(queued);
        }
        Ok(handles)
    }

    /// Dispatch everything pending for `chain_id` now and wait for those
    /// batches to complete. Returns the number of batches dispatched.
    pub async fn flush(&self, chain_id: u64) -> PricingResult<usize> {
        let lane = self.lane(chain_id)?;
        let handles = lane.drain_now();
        let dispatched = handles.len();
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                warn!(chain_id, error = %e, "Batch task ended abnormally");
            }
        }
        Ok(dispatched)
    }

    pub fn stats(&self, chain_id: u64) -> PricingResult<QueueStats> {
        Ok(self.lane(chain_id)?.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::reader::MockBatchReader;
    use super::*;
    use ethers::abi::{encode, parse_abi, Function};
    use ethers::types::{Address, Bytes, U256};
    use mockall::Sequence;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    const CHAIN: u64 = 1;

    fn value_fn() -> Arc<Function> {
        let abi = parse_abi(&["function value() external view returns (uint256)"]).unwrap();
        Arc::new(abi.function("value").unwrap().clone())
    }

    fn call(i: u64) -> ContractCall {
        ContractCall::new(Address::from_low_u64_be(i), &value_fn(), vec![])
    }

    fn ok_outcomes(calls: &[EncodedCall]) -> Vec<CallOutcome> {
        calls
            .iter()
            .map(|c| {
                let n = U256::from_big_endian(c.target.as_bytes());
                CallOutcome::ok(encode(&[Token::Uint(n)]))
            })
            .collect()
    }

    fn batcher(reader: MockBatchReader) -> CallBatcher {
        CallBatcher::new(BatchSettings::default())
            .unwrap()
            .with_chain(CHAIN, Arc::new(reader))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let mut reader = MockBatchReader::new();
        let mut seq = Sequence::new();
        reader
            .expect_aggregate()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow!("connection reset")));
        reader
            .expect_aggregate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|calls| Ok(ok_outcomes(calls)));

        let batcher = batcher(reader);
        let start = Instant::now();
        let handles = batcher.enqueue_many(CHAIN, (1..=3).map(call)).unwrap();
        assert_eq!(batcher.flush(CHAIN).await.unwrap(), 1);

        for (i, handle) in (1..=3u64).zip(handles) {
            let tokens = handle.await.expect("call should succeed after retries");
            assert_eq!(tokens, vec![Token::Uint(U256::from(i))]);
        }
        // 100ms + 200ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_every_member_with_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let mut reader = MockBatchReader::new();
        reader.expect_aggregate().times(3).returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Err(anyhow!("rpc down #{}", n))
        });

        let batcher = batcher(reader);
        let handles = batcher.enqueue_many(CHAIN, (1..=4).map(call)).unwrap();
        batcher.flush(CHAIN).await.unwrap();

        for handle in handles {
            assert_eq!(
                handle.await,
                Err(CallError::Transport {
                    attempts: 3,
                    message: "rpc down #3".to_string(),
                })
            );
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_result_is_retried_as_transport_failure() {
        let mut reader = MockBatchReader::new();
        let mut seq = Sequence::new();
        reader
            .expect_aggregate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|calls| Ok(ok_outcomes(&calls[..1])));
        reader
            .expect_aggregate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|calls| Ok(ok_outcomes(calls)));

        let batcher = batcher(reader);
        let handles = batcher.enqueue_many(CHAIN, (1..=2).map(call)).unwrap();
        batcher.flush(CHAIN).await.unwrap();
        for handle in handles {
            assert!(handle.await.is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_and_bad_data_stay_local() {
        let mut reader = MockBatchReader::new();
        reader.expect_aggregate().times(1).returning(|calls| {
            let mut outcomes = ok_outcomes(calls);
            outcomes[1] = CallOutcome::failed(Bytes::from(vec![0xde, 0xad]));
            outcomes[2] = CallOutcome::ok(Bytes::new());
            Ok(outcomes)
        });

        let batcher = batcher(reader);
        let mut handles = batcher.enqueue_many(CHAIN, (1..=3).map(call)).unwrap();
        batcher.flush(CHAIN).await.unwrap();

        let third = handles.pop().unwrap().await;
        let second = handles.pop().unwrap().await;
        let first = handles.pop().unwrap().await;
        assert_eq!(first, Ok(vec![Token::Uint(U256::from(1))]));
        assert_eq!(
            second,
            Err(CallError::Reverted {
                target: Address::from_low_u64_be(2),
                data: "dead".to_string(),
            })
        );
        assert!(matches!(third, Err(CallError::Decode { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_pending_until_debounce_fires() {
        let mut reader = MockBatchReader::new();
        reader
            .expect_aggregate()
            .times(1)
            .returning(|calls| Ok(ok_outcomes(calls)));

        let batcher = batcher(reader);
        let handle = batcher.enqueue(CHAIN, call(7)).unwrap();
        let mut task = tokio_test::task::spawn(handle);
        tokio_test::assert_pending!(task.poll());

        let stats = batcher.stats(CHAIN).unwrap();
        assert_eq!(stats.phase, QueuePhase::Accumulating);
        assert_eq!(stats.pending, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = tokio_test::assert_ready!(task.poll());
        assert_eq!(result, Ok(vec![Token::Uint(U256::from(7))]));

        let stats = batcher.stats(CHAIN).unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.dispatched_batches, 1);
        assert!(stats.last_dispatch_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_chains_are_config_errors() {
        let batcher = batcher(MockBatchReader::new());
        assert!(matches!(
            batcher.enqueue(31337, call(1)),
            Err(PricingError::UnsupportedChain(31337))
        ));
        assert!(matches!(
            batcher.enqueue(10, call(1)),
            Err(PricingError::NoReader(10))
        ));
        assert!(matches!(
            batcher.flush(10).await,
            Err(PricingError::NoReader(10))
        ));
    }

    #[test]
    fn test_zero_settings_rejected() {
        let zeroed = [
            BatchSettings {
                max_batch_size: 0,
                ..BatchSettings::default()
            },
            BatchSettings {
                max_concurrent_batches: 0,
                ..BatchSettings::default()
            },
            BatchSettings {
                max_attempts: 0,
                ..BatchSettings::default()
            },
        ];
        for settings in zeroed {
            assert!(matches!(
                CallBatcher::new(settings),
                Err(PricingError::Config(_))
            ));
        }
        assert!(CallBatcher::new(BatchSettings::default()).is_ok());
    }

    #[tokio::test]
    async fn test_encoding_error_leaves_queue_untouched() {
        let batcher = batcher(MockBatchReader::new());
        let bad = ContractCall::new(Address::zero(), &value_fn(), vec![Token::Bool(true)]);
        let result = batcher.enqueue_many(CHAIN, vec![call(1), bad]);
        assert!(matches!(result, Err(PricingError::Encoding { .. })));
        assert_eq!(batcher.stats(CHAIN).unwrap().pending, 0);
    }
}
