//! Elastic per-contract instance pool.
//!
//! An [`InstancePool`] keeps pre-instantiated [`WrappedInstance`]s of one
//! contract ready to run. Callers check instances out with
//! [`InstancePool::acquire`] and give them back by dropping the returned
//! [`PooledInstance`].
//!
//! # Control loop
//!
//! Every structural change (grow, shrink, discard-and-replace, reset, close)
//! happens inside one spawned task that consumes [`PoolEvent`]s and a refresh
//! timer, so those changes never race with each other. Acquire and release
//! only touch the idle queue and atomic counters and run concurrently with
//! the loop. While the loop drains the pool for a reset or close, released
//! instances go straight back to it instead of the idle queue, so waiting
//! callers cannot keep a drain from finishing.
//!
//! ```text
//!   acquire ──try_pop──▶ ┌────────────┐ ◀──push── release (healthy)
//!      │                 │ idle queue │
//!      └──Demand──┐      └────────────┘ ◀──push── grow
//!                 ▼             ▲
//!          ┌──────────────┐     │
//!          │ control loop │─────┘
//!          └──────────────┘ ◀──Discard── release (unhealthy)
//!                 ▲
//!          refresh tick / Reset / Close
//! ```

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use wasmtime::Linker;

use crate::instance::WrappedInstance;
use crate::store::InstanceState;
use crate::{CompiledModule, WasmEngine};
use contract_runtime_common::{
    AbiConfig, ContractId, ExecutionConfig, PoolConfig, RuntimeConfig, RuntimeError,
};

/// Messages handled by the control loop.
enum PoolEvent {
    /// A caller found the idle queue empty.
    Demand,
    /// An unhealthy instance to close and replace.
    Discard(WrappedInstance),
    /// An instance released while the pool is draining.
    Drained(WrappedInstance),
    /// Destroy every instance, then warm back up to `min_size`.
    Reset(oneshot::Sender<()>),
    /// Destroy every instance and stop the loop.
    Close(Option<oneshot::Sender<()>>),
}

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances owned by the pool, idle or checked out.
    pub current_size: usize,
    /// Instances waiting in the idle queue.
    pub idle: usize,
    /// Acquisitions since the last refresh tick.
    pub use_count: u64,
    /// Milliseconds callers waited since the last refresh tick.
    pub total_delay_ms: u64,
    /// Demand signals since the last grow.
    pub grow_requests: usize,
    /// Instances discarded for exceeding the error threshold.
    pub discarded: u64,
}

/// Idle instances plus a semaphore whose permits equal the queue length.
///
/// Taking a permit reserves exactly one queued instance, so an instance is
/// never handed to two callers. Closing the semaphore fails every pending
/// and future `pop`.
struct IdleQueue {
    items: Mutex<VecDeque<WrappedInstance>>,
    available: Semaphore,
    returned: Notify,
}

impl IdleQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
            returned: Notify::new(),
        }
    }

    fn push(&self, instance: WrappedInstance) {
        self.items.lock().push_back(instance);
        self.available.add_permits(1);
        self.returned.notify_one();
    }

    fn try_pop(&self) -> Option<WrappedInstance> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.items.lock().pop_front()
    }

    /// Wait for an instance. Returns `None` once the queue is closed.
    async fn pop(&self) -> Option<WrappedInstance> {
        loop {
            let permit = self.available.acquire().await.ok()?;
            permit.forget();
            if let Some(instance) = self.items.lock().pop_front() {
                return Some(instance);
            }
        }
    }

    /// Wait for an instance even after the queue is closed.
    async fn pop_for_drain(&self) -> WrappedInstance {
        loop {
            let returned = self.returned.notified();
            let instance = if self.available.is_closed() {
                self.items.lock().pop_front()
            } else {
                self.try_pop()
            };
            if let Some(instance) = instance {
                return instance;
            }
            returned.await;
        }
    }

    fn close(&self) {
        self.available.close();
    }

    fn is_closed(&self) -> bool {
        self.available.is_closed()
    }

    /// Queue length and `size`, read under the queue lock.
    ///
    /// Instances enter `size` before they are pushed and leave it only after
    /// they are popped, so the length never exceeds `size`.
    fn snapshot(&self, size: &AtomicUsize) -> (usize, usize) {
        let items = self.items.lock();
        (items.len(), size.load(Ordering::SeqCst))
    }
}

/// State shared by the pool handle, checked-out guards and the control loop.
struct PoolShared {
    contract: ContractId,
    config: PoolConfig,
    idle: IdleQueue,
    current_size: AtomicUsize,
    use_count: AtomicU64,
    total_delay_ms: AtomicU64,
    grow_requests: AtomicUsize,
    discarded: AtomicU64,
    /// Set by the control loop for the duration of a drain.
    draining: AtomicBool,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl PoolShared {
    fn release(&self, instance: WrappedInstance) {
        if instance.error_count() > self.config.discard_threshold {
            warn!(
                contract = %self.contract,
                instance_id = %instance.id(),
                errors = instance.error_count(),
                "Discarding unhealthy instance"
            );
            self.hand_to_loop(PoolEvent::Discard(instance));
        } else if self.draining.load(Ordering::SeqCst) {
            self.hand_to_loop(PoolEvent::Drained(instance));
        } else {
            self.idle.push(instance);
        }
    }

    fn hand_to_loop(&self, event: PoolEvent) {
        if self.events.send(event).is_err() {
            // Control loop is gone; the instance is closed on drop.
            self.current_size.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Average acquire wait over the current window.
    ///
    /// The two counters are loaded independently, so under concurrent
    /// acquisitions the ratio is approximate. It only steers autoscaling.
    fn average_delay_ms(&self) -> u64 {
        let count = self.use_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.total_delay_ms.load(Ordering::Relaxed) / count
    }

    fn closed_error(&self) -> RuntimeError {
        RuntimeError::PoolClosed {
            contract: self.contract.to_string(),
        }
    }
}

/// Elastic pool of ready-to-run instances for one contract.
pub struct InstancePool {
    shared: Arc<PoolShared>,
    module: CompiledModule,
    linker: Arc<Linker<InstanceState>>,
    execution: ExecutionConfig,
    abi: AbiConfig,
}

impl InstancePool {
    /// Validate and compile `byte_code`, verify it instantiates, and start the
    /// pool's control loop.
    ///
    /// The loop warms the pool up to `min_size` in the background.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] for invalid byte code,
    /// [`RuntimeError::InstantiationFailed`] if the module cannot be linked,
    /// and [`RuntimeError::InvalidConfig`] for inconsistent pool settings.
    #[instrument(skip(contract, engine, linker, byte_code, config), fields(contract = %contract, bytes_len = byte_code.len()))]
    pub async fn create(
        contract: ContractId,
        byte_code: &[u8],
        engine: &WasmEngine,
        linker: Arc<Linker<InstanceState>>,
        config: &RuntimeConfig,
    ) -> Result<Self, RuntimeError> {
        let module = CompiledModule::from_bytes(engine.inner(), byte_code)?;
        Self::from_module(contract, module, linker, config).await
    }

    /// Start a pool for an already compiled module.
    ///
    /// # Errors
    ///
    /// See [`InstancePool::create`].
    pub async fn from_module(
        contract: ContractId,
        module: CompiledModule,
        linker: Arc<Linker<InstanceState>>,
        config: &RuntimeConfig,
    ) -> Result<Self, RuntimeError> {
        config.pool.validate()?;

        // Fail fast before accepting traffic
        let trial =
            WrappedInstance::instantiate(&linker, &module, contract.clone(), &config.execution)
                .await?;
        drop(trial);
        debug!(contract = %contract, "Byte code verified");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            contract: contract.clone(),
            config: config.pool.clone(),
            idle: IdleQueue::new(config.pool.max_size),
            current_size: AtomicUsize::new(0),
            use_count: AtomicU64::new(0),
            total_delay_ms: AtomicU64::new(0),
            grow_requests: AtomicUsize::new(0),
            discarded: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            events: events_tx,
        });

        let control = ControlLoop {
            shared: Arc::clone(&shared),
            module: module.clone(),
            linker: Arc::clone(&linker),
            execution: config.execution.clone(),
            abi: config.abi.clone(),
            events: events_rx,
            deferred: VecDeque::new(),
        };
        tokio::spawn(control.run());

        info!(
            contract = %contract,
            min_size = config.pool.min_size,
            max_size = config.pool.max_size,
            "Instance pool started"
        );

        Ok(Self {
            shared,
            module,
            linker,
            execution: config.execution.clone(),
            abi: config.abi.clone(),
        })
    }

    /// Check out an idle instance, waiting if none is available.
    ///
    /// When the queue is empty a demand signal is sent to the control loop
    /// and the wait time is recorded for the autoscaling heuristic.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::PoolClosed`] once the pool is closed and
    /// [`RuntimeError::AcquireTimeout`] if the configured timeout elapses.
    pub async fn acquire(&self) -> Result<PooledInstance, RuntimeError> {
        let shared = &self.shared;
        if shared.idle.is_closed() {
            return Err(shared.closed_error());
        }

        if let Some(instance) = shared.idle.try_pop() {
            shared.use_count.fetch_add(1, Ordering::Relaxed);
            return Ok(self.check_out(instance));
        }

        debug!(contract = %shared.contract, "No idle instance, signalling demand");
        // A closed loop means the pool is closing; pop() fails below.
        let _ = shared.events.send(PoolEvent::Demand);

        let start = Instant::now();
        let instance = match shared.config.acquire_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, shared.idle.pop())
                .await
                .map_err(|_| RuntimeError::AcquireTimeout {
                    contract: shared.contract.to_string(),
                    timeout_ms: shared.config.acquire_timeout_ms.unwrap_or_default(),
                })?,
            None => shared.idle.pop().await,
        }
        .ok_or_else(|| shared.closed_error())?;

        let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        shared.use_count.fetch_add(1, Ordering::Relaxed);
        shared.total_delay_ms.fetch_add(waited_ms, Ordering::Relaxed);
        debug!(contract = %shared.contract, waited_ms, "Got instance after waiting");

        Ok(self.check_out(instance))
    }

    fn check_out(&self, mut instance: WrappedInstance) -> PooledInstance {
        instance.touch();
        PooledInstance {
            instance: Some(instance),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Destroy every instance and warm back up to `min_size`.
    ///
    /// Waits for checked-out instances to be released.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::PoolClosed`] if the pool closed first.
    pub async fn reset(&self) -> Result<(), RuntimeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared
            .events
            .send(PoolEvent::Reset(ack_tx))
            .map_err(|_| self.shared.closed_error())?;
        ack_rx.await.map_err(|_| self.shared.closed_error())
    }

    /// Close the pool permanently.
    ///
    /// Pending and future acquisitions fail immediately. Returns once every
    /// instance, including checked-out ones after their release, has been
    /// deallocated and closed.
    pub async fn close(&self) {
        self.shared.idle.close();
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .shared
            .events
            .send(PoolEvent::Close(Some(ack_tx)))
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    /// Instantiate the pool's module outside the idle queue.
    ///
    /// Used for nested cross-contract calls, which must not wait on the
    /// pool that is already serving the outer call. The instance is not
    /// counted in `current_size`; hand it back with
    /// [`InstancePool::close_instance`].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::PoolClosed`] once the pool is closed, or the
    /// instantiation error.
    pub async fn new_instance(&self) -> Result<WrappedInstance, RuntimeError> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }
        WrappedInstance::instantiate(
            &self.linker,
            &self.module,
            self.shared.contract.clone(),
            &self.execution,
        )
        .await
    }

    /// Deallocate and close an instance from [`InstancePool::new_instance`].
    pub async fn close_instance(&self, instance: WrappedInstance) {
        debug!(contract = %self.shared.contract, instance_id = %instance.id(), "Closing unpooled instance");
        instance.destroy(&self.abi, self.execution.gas_limit).await;
    }

    /// The contract served by this pool.
    pub fn contract(&self) -> &ContractId {
        &self.shared.contract
    }

    /// The shared compiled module.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// Pool sizing configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Returns `true` once [`InstancePool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.idle.is_closed()
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let (idle, current_size) = shared.idle.snapshot(&shared.current_size);
        PoolStats {
            current_size,
            idle,
            use_count: shared.use_count.load(Ordering::Relaxed),
            total_delay_ms: shared.total_delay_ms.load(Ordering::Relaxed),
            grow_requests: shared.grow_requests.load(Ordering::Relaxed),
            discarded: shared.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Drop for InstancePool {
    fn drop(&mut self) {
        self.shared.idle.close();
        let _ = self.shared.events.send(PoolEvent::Close(None));
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("contract", &self.shared.contract)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A checked-out instance. Dropping it releases the instance to its pool.
pub struct PooledInstance {
    instance: Option<WrappedInstance>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledInstance {
    type Target = WrappedInstance;

    fn deref(&self) -> &WrappedInstance {
        self.instance
            .as_ref()
            .unwrap_or_else(|| unreachable!("instance taken before drop"))
    }
}

impl DerefMut for PooledInstance {
    fn deref_mut(&mut self) -> &mut WrappedInstance {
        self.instance
            .as_mut()
            .unwrap_or_else(|| unreachable!("instance taken before drop"))
    }
}

impl std::fmt::Debug for PooledInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledInstance").field(&self.instance).finish()
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.shared.release(instance);
        }
    }
}

/// Single writer of the pool's structure.
struct ControlLoop {
    shared: Arc<PoolShared>,
    module: CompiledModule,
    linker: Arc<Linker<InstanceState>>,
    execution: ExecutionConfig,
    abi: AbiConfig,
    events: mpsc::UnboundedReceiver<PoolEvent>,
    /// Events that arrived while draining.
    deferred: VecDeque<PoolEvent>,
}

impl ControlLoop {
    #[instrument(skip_all, fields(contract = %self.shared.contract))]
    async fn run(mut self) {
        self.grow(self.shared.config.min_size).await;

        let period = self.shared.config.refresh_interval();
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = match self.deferred.pop_front() {
                Some(event) => event,
                None => tokio::select! {
                    _ = refresh.tick() => {
                        self.on_refresh().await;
                        continue;
                    }
                    event = self.events.recv() => event.unwrap_or(PoolEvent::Close(None)),
                },
            };

            match event {
                PoolEvent::Demand => self.on_demand().await,
                PoolEvent::Discard(instance) => self.on_discard(instance).await,
                PoolEvent::Drained(instance) => self.shared.idle.push(instance),
                PoolEvent::Reset(ack) => {
                    self.on_reset().await;
                    let _ = ack.send(());
                }
                PoolEvent::Close(ack) => {
                    self.on_close().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
        }

        debug!("Control loop stopped");
    }

    async fn on_demand(&mut self) {
        let requests = self.shared.grow_requests.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(grow_requests = requests, "Handling demand signal");

        if self.should_grow() {
            self.grow(self.shared.config.grow_step).await;
            self.shared.grow_requests.store(0, Ordering::Relaxed);
        }
    }

    async fn on_refresh(&mut self) {
        debug!(
            average_delay_ms = self.shared.average_delay_ms(),
            "Handling refresh tick"
        );

        if self.should_grow() {
            self.grow(self.shared.config.grow_step).await;
            self.shared.grow_requests.store(0, Ordering::Relaxed);
        } else if self.should_shrink() {
            self.shrink(self.shared.config.grow_step).await;
        }

        // Start a new observation window
        self.shared.use_count.store(0, Ordering::Relaxed);
        self.shared.total_delay_ms.store(0, Ordering::Relaxed);
    }

    async fn on_discard(&mut self, instance: WrappedInstance) {
        self.shared.discarded.fetch_add(1, Ordering::Relaxed);
        self.retire(instance).await;
        self.grow(1).await;
    }

    async fn on_reset(&mut self) {
        info!("Resetting instance pool");
        self.drain().await;
        self.grow(self.shared.config.min_size).await;
    }

    async fn on_close(&mut self) {
        self.shared.idle.close();
        self.drain().await;
        info!("Instance pool closed");
    }

    fn should_grow(&self) -> bool {
        let config = &self.shared.config;
        let current = self.shared.current_size.load(Ordering::SeqCst);
        if current < config.min_size {
            return true;
        }

        current + config.grow_step <= config.max_size
            && (self.shared.grow_requests.load(Ordering::Relaxed) > config.grow_threshold
                || self.shared.average_delay_ms() > config.delay_tolerance_ms)
    }

    fn should_shrink(&self) -> bool {
        let config = &self.shared.config;
        let current = self.shared.current_size.load(Ordering::SeqCst);

        current > config.min_size
            && self.shared.average_delay_ms() <= config.delay_tolerance_ms
            && current > config.grow_step
    }

    /// Add up to `count` instances without exceeding `max_size`.
    async fn grow(&mut self, count: usize) {
        let current = self.shared.current_size.load(Ordering::SeqCst);
        let target = (current + count).min(self.shared.config.max_size);
        let mut added = 0;

        while self.shared.current_size.load(Ordering::SeqCst) < target {
            match WrappedInstance::instantiate(
                &self.linker,
                &self.module,
                self.shared.contract.clone(),
                &self.execution,
            )
            .await
            {
                Ok(instance) => {
                    self.shared.current_size.fetch_add(1, Ordering::SeqCst);
                    self.shared.idle.push(instance);
                    added += 1;
                }
                Err(e) => {
                    error!(error = %e, "Failed to instantiate pool instance");
                    break;
                }
            }
        }

        if added > 0 {
            info!(
                added,
                current_size = self.shared.current_size.load(Ordering::SeqCst),
                "Instance pool grew"
            );
        }
    }

    /// Close up to `count` idle instances without going below `min_size`.
    async fn shrink(&mut self, count: usize) {
        let current = self.shared.current_size.load(Ordering::SeqCst);
        let removable = current
            .saturating_sub(self.shared.config.min_size)
            .min(count);
        let mut removed = 0;

        for _ in 0..removable {
            let Some(instance) = self.shared.idle.try_pop() else {
                break;
            };
            self.retire(instance).await;
            removed += 1;
        }

        if removed > 0 {
            info!(
                removed,
                current_size = self.shared.current_size.load(Ordering::SeqCst),
                "Instance pool shrank"
            );
        }
    }

    /// Destroy every instance, waiting for checked-out ones to come back.
    async fn drain(&mut self) {
        self.shared.draining.store(true, Ordering::SeqCst);
        while self.shared.current_size.load(Ordering::SeqCst) > 0 {
            let next = tokio::select! {
                instance = self.shared.idle.pop_for_drain() => Some(instance),
                event = self.events.recv() => self.take_discarded(event),
            };
            if let Some(instance) = next {
                self.retire(instance).await;
            }
        }
        self.shared.draining.store(false, Ordering::SeqCst);
    }

    fn take_discarded(&mut self, event: Option<PoolEvent>) -> Option<WrappedInstance> {
        match event? {
            PoolEvent::Discard(instance) => {
                self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                Some(instance)
            }
            PoolEvent::Drained(instance) => Some(instance),
            PoolEvent::Demand => None,
            other => {
                self.deferred.push_back(other);
                None
            }
        }
    }

    async fn retire(&mut self, instance: WrappedInstance) {
        self.shared.current_size.fetch_sub(1, Ordering::SeqCst);
        instance.destroy(&self.abi, self.execution.gas_limit).await;
    }
}
