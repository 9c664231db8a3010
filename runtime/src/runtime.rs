//! # Runtime
//!
//! The process-wide context: agents built from the driver's nodes, the
//! signal and queue registries, the allocation map and the registration
//! database.
//!
//! A [`Runtime`] can be built explicitly with [`Runtime::new`], or shared
//! through the refcounted global with [`Runtime::acquire`] and
//! [`Runtime::release`]. The global is built on the first acquire and torn
//! down on the last release.
//!
//! ## Queue wiring
//!
//! ```text
//!  queue_create(GPU) ──► inactive signal ──► AqlQueue ──► doorbell handle
//!                              │                 │
//!                              ▼                 ▼
//!                        AsyncEvents        SoftCommandProcessor
//!                      (handle_fault)         (consumes ring)
//! ```

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::vec::Vec;

use hashbrown::HashMap;
use hcr_core::{ConfigProvider, Error, Handle, HandleTable, KernelMutex, Result, RuntimeFlags};
use hcr_hal::Kfd;
use hcr_memory::{AccessPermission, MemoryDatabase, MemoryRegion, RegionId, RegionOwner};
use hcr_queue::{
    AqlQueue, CpThread, ErrorCallback, HostQueue, Queue, QueueFeatures, QueueType, SignalResolver,
    SoftCommandProcessor,
};
use hcr_signal::{
    Condition, DefaultSignal, InterruptSignal, Signal, SignalHandle, SignalTable, SignalValue,
};

use crate::agent::{Agent, AgentId, AgentKind};
use crate::async_events::{AsyncEvents, AsyncHandler, AsyncHandlerId};
use crate::cpu_agent::CpuAgent;
use crate::gpu_agent::GpuAgent;

// =============================================================================
// HANDLES
// =============================================================================

/// Marker for queue handles
#[derive(Debug)]
pub enum QueueTag {}

/// Opaque public queue handle
pub type QueueHandle = Handle<QueueTag>;

#[derive(Debug, Clone)]
enum QueueKind {
    Host(Arc<HostQueue>),
    Aql(Arc<AqlQueue>),
}

/// Everything the runtime created for one queue
#[derive(Debug)]
struct QueueEntry {
    kind: QueueKind,
    agent: AgentId,
    /// Signals published on the queue's behalf, destroyed with it
    owned_signals: Vec<SignalHandle>,
    async_handler: Option<AsyncHandlerId>,
    cp: KernelMutex<Option<CpThread>>,
}

#[derive(Debug)]
struct Allocation {
    region: Arc<MemoryRegion>,
    size: usize,
}

// =============================================================================
// GLOBAL INSTANCE
// =============================================================================

struct Global {
    runtime: Arc<Runtime>,
    refs: u32,
}

/// Held across build and shutdown so one runtime at most is live
static GLOBAL: KernelMutex<Option<Global>> = KernelMutex::new(None);

// =============================================================================
// RUNTIME
// =============================================================================

/// Process-wide runtime context
#[derive(Debug)]
pub struct Runtime {
    kfd: Arc<dyn Kfd>,
    flags: RuntimeFlags,
    cpu_agents: Vec<Arc<CpuAgent>>,
    gpu_agents: Vec<Arc<GpuAgent>>,
    agents: Vec<Arc<dyn Agent>>,
    signals: Arc<SignalTable>,
    queues: HandleTable<QueueTag, Arc<QueueEntry>>,
    allocations: KernelMutex<HashMap<usize, Allocation>>,
    database: MemoryDatabase,
    async_events: AsyncEvents,
    next_queue_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Build a runtime over every node `kfd` reports
    ///
    /// CPU agents come first. Queue rings live in the first CPU node's
    /// system memory, which is made resident on every GPU.
    pub fn new(kfd: Arc<dyn Kfd>, flags: RuntimeFlags) -> Result<Self> {
        let nodes = kfd.nodes()?;

        let cpu_agents: Vec<Arc<CpuAgent>> = nodes
            .iter()
            .filter(|n| !n.is_gpu())
            .map(|n| Arc::new(CpuAgent::new(kfd.clone(), n.clone())))
            .collect();
        let system_node = match cpu_agents.first() {
            Some(cpu) => cpu.node_id(),
            None => {
                log::error!("runtime: driver reports no CPU node");
                return Err(Error::InvalidAgent);
            },
        };
        let gpu_agents = nodes
            .iter()
            .filter(|n| n.is_gpu())
            .map(|n| GpuAgent::new(kfd.clone(), n.clone(), system_node, &flags).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let gpu_ids: Vec<u32> = gpu_agents.iter().map(|g| g.node_id()).collect();
        for cpu in &cpu_agents {
            cpu.map_system_memory_to(&gpu_ids);
        }

        let mut agents: Vec<Arc<dyn Agent>> = Vec::with_capacity(nodes.len());
        agents.extend(cpu_agents.iter().map(|a| Arc::clone(a) as Arc<dyn Agent>));
        agents.extend(gpu_agents.iter().map(|a| Arc::clone(a) as Arc<dyn Agent>));

        let wake: Arc<dyn Signal> = if flags.enable_interrupt {
            Arc::new(InterruptSignal::new(kfd.clone(), 0, flags.wait_spin_window)?)
        } else {
            Arc::new(DefaultSignal::new(0))
        };
        let async_events = AsyncEvents::start(wake, flags.wait_spin_window)?;

        log::debug!(
            "runtime: {} CPU agents, {} GPU agents, interrupts {}",
            cpu_agents.len(),
            gpu_agents.len(),
            if flags.enable_interrupt { "on" } else { "off" }
        );
        Ok(Self {
            database: MemoryDatabase::new(kfd.clone()),
            kfd,
            flags,
            cpu_agents,
            gpu_agents,
            agents,
            signals: Arc::new(SignalTable::new()),
            queues: HandleTable::new(),
            allocations: KernelMutex::new(HashMap::new()),
            async_events,
            next_queue_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Global instance
    // =========================================================================

    /// Take a reference on the global runtime, building it if needed
    ///
    /// `kfd` and `provider` are only used by the acquire that builds it.
    pub fn acquire(kfd: Arc<dyn Kfd>, provider: &dyn ConfigProvider) -> Result<Arc<Runtime>> {
        let mut global = GLOBAL.lock();
        if let Some(global) = global.as_mut() {
            global.refs = global.refs.checked_add(1).ok_or(Error::RefcountOverflow)?;
            return Ok(Arc::clone(&global.runtime));
        }
        let runtime = Arc::new(Runtime::new(kfd, RuntimeFlags::from_provider(provider))?);
        *global = Some(Global {
            runtime: Arc::clone(&runtime),
            refs: 1,
        });
        log::debug!("runtime: acquired");
        Ok(runtime)
    }

    /// Drop a reference taken with [`Runtime::acquire`]
    ///
    /// The last release shuts the runtime down.
    pub fn release() -> Result<()> {
        let mut guard = GLOBAL.lock();
        let global = guard.as_mut().ok_or(Error::NotInitialized)?;
        global.refs -= 1;
        if global.refs == 0 {
            if let Some(last) = guard.take() {
                last.runtime.shutdown();
                log::debug!("runtime: released");
            }
        }
        Ok(())
    }

    /// The global runtime, if acquired
    pub fn current() -> Option<Arc<Runtime>> {
        GLOBAL.lock().as_ref().map(|g| Arc::clone(&g.runtime))
    }

    // =========================================================================
    // Agents and regions
    // =========================================================================

    /// Flags the runtime was built with
    pub fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    /// Driver
    pub fn kfd(&self) -> &Arc<dyn Kfd> {
        &self.kfd
    }

    /// Every agent, CPUs first
    pub fn agents(&self) -> &[Arc<dyn Agent>] {
        &self.agents
    }

    /// CPU agents
    pub fn cpu_agents(&self) -> &[Arc<CpuAgent>] {
        &self.cpu_agents
    }

    /// GPU agents
    pub fn gpu_agents(&self) -> &[Arc<GpuAgent>] {
        &self.gpu_agents
    }

    /// Find an agent
    pub fn agent(&self, id: AgentId) -> Option<Arc<dyn Agent>> {
        self.agents.iter().find(|a| a.id() == id).cloned()
    }

    fn cpu_agent(&self, id: AgentId) -> Option<&Arc<CpuAgent>> {
        self.cpu_agents.iter().find(|a| a.id() == id)
    }

    fn gpu_agent(&self, id: AgentId) -> Option<&Arc<GpuAgent>> {
        self.gpu_agents.iter().find(|a| a.id() == id)
    }

    /// Find a region of any agent
    pub fn region(&self, id: RegionId) -> Option<Arc<MemoryRegion>> {
        self.agents.iter().find_map(|a| a.region(id))
    }

    /// Every region of every agent
    pub fn regions(&self) -> Vec<Arc<MemoryRegion>> {
        self.agents
            .iter()
            .flat_map(|a| a.regions().iter().cloned())
            .collect()
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Create a signal waited on by `consumers`
    ///
    /// With interrupts enabled the signal can sleep in the driver when no
    /// consumer is named or one of them is a CPU; signals only GPUs wait on
    /// are busy-poll.
    pub fn signal_create(&self, initial: SignalValue, consumers: &[AgentId]) -> Result<SignalHandle> {
        let mut host_consumed = consumers.is_empty();
        for id in consumers {
            let agent = self.agent(*id).ok_or(Error::InvalidAgent)?;
            host_consumed |= agent.kind() == AgentKind::Cpu;
        }
        let signal = self.make_signal(initial, host_consumed)?;
        Ok(self.signals.insert(signal))
    }

    fn make_signal(&self, initial: SignalValue, host_consumed: bool) -> Result<Arc<dyn Signal>> {
        Ok(if self.flags.enable_interrupt && host_consumed {
            Arc::new(InterruptSignal::new(
                self.kfd.clone(),
                initial,
                self.flags.wait_spin_window,
            )?)
        } else {
            Arc::new(DefaultSignal::new(initial))
        })
    }

    /// Destroy a signal
    ///
    /// Blocks until current waiters have left.
    pub fn signal_destroy(&self, handle: SignalHandle) -> Result<()> {
        self.signals.destroy(handle)
    }

    /// Resolve a signal handle
    pub fn signal_get(&self, handle: SignalHandle) -> Result<Arc<dyn Signal>> {
        self.signals.get(handle).ok_or(Error::InvalidSignal)
    }

    /// Signal registry
    pub fn signal_table(&self) -> &Arc<SignalTable> {
        &self.signals
    }

    /// Run `handler` on the async thread once `signal` satisfies
    /// `condition` against `value`
    pub fn set_async_signal_handler(
        &self,
        signal: SignalHandle,
        condition: Condition,
        value: SignalValue,
        handler: AsyncHandler,
    ) -> Result<AsyncHandlerId> {
        let signal = self.signal_get(signal)?;
        self.async_events.register(signal, condition, value, handler)
    }

    /// Cancel a handler set with [`Runtime::set_async_signal_handler`]
    pub fn cancel_async_signal_handler(&self, id: AsyncHandlerId) {
        self.async_events.unregister(id);
    }

    // =========================================================================
    // Queues
    // =========================================================================

    /// Create a queue consumed by `agent`
    ///
    /// GPU agents get an [`AqlQueue`] whose faults are reported to
    /// `callback` after the queue is inactivated. CPU agents get a
    /// [`HostQueue`] the application drains; `callback` is unused.
    pub fn queue_create(
        &self,
        agent: AgentId,
        capacity: u32,
        queue_type: QueueType,
        callback: Option<ErrorCallback>,
    ) -> Result<QueueHandle> {
        let id = self.next_queue_id.fetch_add(1, Ordering::Relaxed);
        if let Some(gpu) = self.gpu_agent(agent) {
            return self.create_aql_queue(gpu, capacity, queue_type, id, callback);
        }
        let cpu = self.cpu_agent(agent).ok_or(Error::InvalidAgent)?;

        let doorbell = self.make_signal(0, true)?;
        let doorbell_handle = self.signals.insert(Arc::clone(&doorbell));
        let queue = match cpu.create_queue(capacity, queue_type, doorbell, doorbell_handle.raw(), id) {
            Ok(queue) => Arc::new(queue),
            Err(err) => {
                self.destroy_owned_signals(&[doorbell_handle]);
                return Err(err);
            },
        };
        log::debug!("runtime: host queue {} on agent {}", id, agent.0);
        Ok(self.queues.insert(Arc::new(QueueEntry {
            kind: QueueKind::Host(queue),
            agent,
            owned_signals: vec![doorbell_handle],
            async_handler: None,
            cp: KernelMutex::new(None),
        })))
    }

    fn create_aql_queue(
        &self,
        gpu: &GpuAgent,
        capacity: u32,
        queue_type: QueueType,
        id: u64,
        callback: Option<ErrorCallback>,
    ) -> Result<QueueHandle> {
        let inactive = self.make_signal(0, true)?;
        let inactive_handle = self.signals.insert(Arc::clone(&inactive));
        let queue = match gpu.create_queue(capacity, queue_type, id, Arc::clone(&inactive), callback) {
            Ok(queue) => Arc::new(queue),
            Err(err) => {
                self.destroy_owned_signals(&[inactive_handle]);
                return Err(err);
            },
        };
        let doorbell_handle = self.signals.insert(Arc::clone(&queue) as Arc<dyn Signal>);
        queue.bind_handles(doorbell_handle.raw(), inactive_handle.raw());
        let owned_signals = vec![doorbell_handle, inactive_handle];

        let weak: Weak<AqlQueue> = Arc::downgrade(&queue);
        let registered = self.async_events.register(
            inactive,
            Condition::Ne,
            0,
            Box::new(move |value| weak.upgrade().and_then(|q| q.handle_fault(value))),
        );
        let async_handler = match registered {
            Ok(handler) => handler,
            Err(err) => {
                self.retire_aql(gpu, &queue, &owned_signals, None, None);
                return Err(err);
            },
        };

        let signals = Arc::clone(&self.signals);
        let resolver: SignalResolver =
            Arc::new(move |raw| signals.get(SignalHandle::from_raw(raw)));
        let cp = match Arc::new(SoftCommandProcessor::new(Arc::clone(&queue), resolver)).spawn() {
            Ok(cp) => cp,
            Err(err) => {
                self.retire_aql(gpu, &queue, &owned_signals, Some(async_handler), None);
                return Err(err);
            },
        };

        log::debug!(
            "runtime: AQL queue {} on agent {}, {} packets",
            id,
            gpu.node_id(),
            queue.capacity()
        );
        Ok(self.queues.insert(Arc::new(QueueEntry {
            kind: QueueKind::Aql(queue),
            agent: AgentId(gpu.node_id()),
            owned_signals,
            async_handler: Some(async_handler),
            cp: KernelMutex::new(Some(cp)),
        })))
    }

    /// Create a host queue over `region` rung through the caller's
    /// `doorbell` signal
    ///
    /// The doorbell stays owned by the caller.
    pub fn soft_queue_create(
        &self,
        region: RegionId,
        capacity: u32,
        queue_type: QueueType,
        features: QueueFeatures,
        doorbell: SignalHandle,
    ) -> Result<QueueHandle> {
        let region = self.region(region).ok_or(Error::InvalidRegion)?;
        let signal = self.signal_get(doorbell)?;
        let id = self.next_queue_id.fetch_add(1, Ordering::Relaxed);
        let agent = AgentId(region.node_id());
        let queue = HostQueue::new(region, capacity, queue_type, features, signal, doorbell.raw(), id)?;
        Ok(self.queues.insert(Arc::new(QueueEntry {
            kind: QueueKind::Host(Arc::new(queue)),
            agent,
            owned_signals: Vec::new(),
            async_handler: None,
            cp: KernelMutex::new(None),
        })))
    }

    /// Resolve a queue handle
    pub fn queue_get(&self, handle: QueueHandle) -> Result<Arc<dyn Queue>> {
        let entry = self.queues.get(handle).ok_or(Error::InvalidQueue)?;
        Ok(match &entry.kind {
            QueueKind::Host(queue) => Arc::clone(queue) as Arc<dyn Queue>,
            QueueKind::Aql(queue) => Arc::clone(queue) as Arc<dyn Queue>,
        })
    }

    /// Resolve a handle to a host queue
    pub fn host_queue(&self, handle: QueueHandle) -> Result<Arc<HostQueue>> {
        match &self.queues.get(handle).ok_or(Error::InvalidQueue)?.kind {
            QueueKind::Host(queue) => Ok(Arc::clone(queue)),
            QueueKind::Aql(_) => Err(Error::InvalidQueue),
        }
    }

    /// Resolve a handle to an AQL queue
    pub fn aql_queue(&self, handle: QueueHandle) -> Result<Arc<AqlQueue>> {
        match &self.queues.get(handle).ok_or(Error::InvalidQueue)?.kind {
            QueueKind::Aql(queue) => Ok(Arc::clone(queue)),
            QueueKind::Host(_) => Err(Error::InvalidQueue),
        }
    }

    /// Agent consuming a queue
    pub fn queue_agent(&self, handle: QueueHandle) -> Result<AgentId> {
        Ok(self.queues.get(handle).ok_or(Error::InvalidQueue)?.agent)
    }

    /// Destroy a queue and the signals created for it
    ///
    /// The handle stops resolving first. Packets still in the ring are
    /// dropped.
    pub fn queue_destroy(&self, handle: QueueHandle) -> Result<()> {
        let entry = self.queues.remove(handle).ok_or(Error::InvalidQueue)?;
        self.retire_entry(&entry);
        Ok(())
    }

    fn retire_entry(&self, entry: &QueueEntry) {
        match &entry.kind {
            QueueKind::Host(queue) => {
                if let Err(err) = queue.inactivate() {
                    log::warn!("runtime: host queue {}: {}", queue.id(), err);
                }
                self.destroy_owned_signals(&entry.owned_signals);
                log::debug!("runtime: host queue {} destroyed", queue.id());
            },
            QueueKind::Aql(queue) => match self.gpu_agent(entry.agent) {
                Some(gpu) => {
                    let cp = entry.cp.lock().take();
                    self.retire_aql(gpu, queue, &entry.owned_signals, entry.async_handler, cp);
                },
                None => log::error!("runtime: queue {} has no GPU agent {}", queue.id(), entry.agent.0),
            },
        }
    }

    fn retire_aql(
        &self,
        gpu: &GpuAgent,
        queue: &AqlQueue,
        owned_signals: &[SignalHandle],
        async_handler: Option<AsyncHandlerId>,
        cp: Option<CpThread>,
    ) {
        if let Some(handler) = async_handler {
            self.async_events.unregister(handler);
        }
        if let Err(err) = queue.inactivate() {
            log::warn!("runtime: queue {}: driver destroy failed: {}", queue.id(), err);
        }
        if let Some(mut cp) = cp {
            cp.stop();
        }
        self.destroy_owned_signals(owned_signals);
        gpu.release_queue();
        log::debug!("runtime: AQL queue {} destroyed", queue.id());
    }

    fn destroy_owned_signals(&self, handles: &[SignalHandle]) {
        for handle in handles {
            if self.signals.destroy(*handle).is_err() {
                log::warn!("runtime: queue signal {:#x} already destroyed", handle.raw());
            }
        }
    }

    /// Number of live queues
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Allocate `size` bytes from a region
    pub fn allocate_memory(&self, region: RegionId, size: usize) -> Result<usize> {
        let region = self.region(region).ok_or(Error::InvalidRegion)?;
        let addr = region.allocate(size)?;
        self.allocations.lock().insert(addr, Allocation { region, size });
        Ok(addr)
    }

    /// Free memory returned by [`Runtime::allocate_memory`]
    pub fn free_memory(&self, ptr: usize) -> Result<()> {
        let allocation = self
            .allocations
            .lock()
            .remove(&ptr)
            .ok_or(Error::InvalidArgument)?;
        allocation.region.free(ptr, allocation.size);
        Ok(())
    }

    /// Grant `agent` access to an allocation
    pub fn assign_agent(&self, ptr: usize, agent: AgentId, access: AccessPermission) -> Result<()> {
        let agent = self.agent(agent).ok_or(Error::InvalidAgent)?;
        let (region, size) = {
            let allocations = self.allocations.lock();
            let allocation = allocations.get(&ptr).ok_or(Error::InvalidArgument)?;
            (Arc::clone(&allocation.region), allocation.size)
        };
        region.assign_agent(ptr, size, agent.as_region_owner(), access)
    }

    /// Pin a host range for device access
    pub fn register_memory(&self, ptr: usize, size: usize) -> Result<()> {
        if ptr == 0 || size == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.database.register(ptr, size) {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Drop a registration made with [`Runtime::register_memory`]
    pub fn deregister_memory(&self, ptr: usize) -> Result<()> {
        if self.database.deregister(ptr) {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Registration database
    pub fn memory_database(&self) -> &MemoryDatabase {
        &self.database
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Destroy every queue, signal, allocation and registration
    ///
    /// Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, entry) in self.queues.drain() {
            self.retire_entry(&entry);
        }
        self.async_events.shutdown();
        self.signals.destroy_all();

        let allocations: Vec<(usize, Allocation)> = self.allocations.lock().drain().collect();
        for (ptr, allocation) in allocations {
            allocation.region.free(ptr, allocation.size);
        }
        self.database.deregister_all();
        log::debug!("runtime: shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
