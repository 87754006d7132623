// Execution scheduler
//
// The runtime's single-writer actor. One task owns every block instance, the
// binding table and the persistence orchestration; everything else talks to
// it through the command channel. Block executions are serial — a block
// author gets single-threaded semantics for free — and change-driven:
// a bus telegram is routed to the bound input ports, ports whose coerced
// value actually changed enqueue their block, the queue drains until the
// graph is quiescent. Unchanged block outputs are suppressed at the bus,
// which is what terminates degenerate cycles while legitimate oscillators
// keep running.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::{AddressKey, AddressSpec};
use crate::bindings::{derive_iko_key, BindingTable};
use crate::blocks::{Block, BlockCtx, BlockDescriptor, BlockRegistry, LoadReport, PortDef, Trigger};
use crate::bus::{Address, AddressBus, AddressDescriptor, AddressFilter, AddressPatch};
use crate::dpt;
use crate::gateway::{Gateway, InboundFrame};
use crate::persist::{
    load_config, save_config_atomic, AddressDb, Backup, BlockConfig, LogicConfig, Page,
};
use crate::remanent::RemanentStore;
use crate::telegram::Telegram;
use crate::types::{Direction, Error, Lifecycle, Origin, Result};
use crate::value::Value;

const DEBUG_RING_CAPACITY: usize = 32;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const FAILURE_LIMIT: usize = 3;
/// Executions per drain pass. Leftover work resumes on the next loop
/// iteration, so a hot feedback loop cannot starve commands.
const DRAIN_BUDGET: usize = 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Commands and handle
// ─────────────────────────────────────────────────────────────────────────────

enum Command {
    WriteAddress {
        key: String,
        value: Value,
        origin: Origin,
        reply: oneshot::Sender<Result<Option<Telegram>>>,
    },
    CreateAddress {
        desc: AddressDescriptor,
        reply: oneshot::Sender<Result<Address>>,
    },
    EnsureAddress {
        desc: AddressDescriptor,
        reply: oneshot::Sender<Result<Address>>,
    },
    UpdateAddress {
        key: String,
        patch: AddressPatch,
        reply: oneshot::Sender<Result<Address>>,
    },
    DeleteAddress {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    InstantiateBlock {
        type_key: String,
        name: Option<String>,
        page_id: Option<String>,
        reply: oneshot::Sender<Result<InstanceInfo>>,
    },
    DeleteBlock {
        instance: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetEnabled {
        instance: String,
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Bind {
        instance: String,
        port: String,
        direction: Direction,
        address: String,
        auto_create: bool,
        reply: oneshot::Sender<Result<AddressKey>>,
    },
    Unbind {
        instance: String,
        port: String,
        direction: Direction,
        reply: oneshot::Sender<Result<()>>,
    },
    SetInput {
        instance: String,
        port: String,
        value: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    TriggerBlock {
        instance: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ListBlocks {
        reply: oneshot::Sender<Vec<InstanceInfo>>,
    },
    ListTypes {
        reply: oneshot::Sender<Vec<BlockDescriptor>>,
    },
    ReloadCustomBlocks {
        reply: oneshot::Sender<LoadReport>,
    },
    CreatePage {
        page: Page,
        reply: oneshot::Sender<Result<Page>>,
    },
    UpdatePage {
        id: String,
        name: Option<String>,
        description: Option<String>,
        reply: oneshot::Sender<Result<Page>>,
    },
    DeletePage {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ListPages {
        reply: oneshot::Sender<Vec<Page>>,
    },
    GetPositions {
        reply: oneshot::Sender<serde_json::Map<String, serde_json::Value>>,
    },
    SetPositions {
        positions: serde_json::Map<String, serde_json::Value>,
        reply: oneshot::Sender<()>,
    },
    ExportBackup {
        reply: oneshot::Sender<Result<Backup>>,
    },
    ImportBackup {
        backup: Box<Backup>,
        reply: oneshot::Sender<Result<()>>,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the runtime task. All mutation goes through here.
#[derive(Clone)]
pub struct RuntimeHandle {
    tx: mpsc::Sender<Command>,
}

macro_rules! ask {
    ($self:ident, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .tx
            .send(Command::$variant { $($field: $value,)* reply })
            .await
            .map_err(|_| Error::RuntimeStopped)?;
        rx.await.map_err(|_| Error::RuntimeStopped)
    }};
}

impl RuntimeHandle {
    pub async fn write_address(
        &self,
        key: &str,
        value: Value,
        origin: Origin,
    ) -> Result<Option<Telegram>> {
        ask!(self, WriteAddress { key: key.to_string(), value: value, origin: origin })?
    }

    pub async fn create_address(&self, desc: AddressDescriptor) -> Result<Address> {
        ask!(self, CreateAddress { desc: desc })?
    }

    pub async fn ensure_address(&self, desc: AddressDescriptor) -> Result<Address> {
        ask!(self, EnsureAddress { desc: desc })?
    }

    pub async fn update_address(&self, key: &str, patch: AddressPatch) -> Result<Address> {
        ask!(self, UpdateAddress { key: key.to_string(), patch: patch })?
    }

    pub async fn delete_address(&self, key: &str) -> Result<()> {
        ask!(self, DeleteAddress { key: key.to_string() })?
    }

    pub async fn instantiate_block(
        &self,
        type_key: &str,
        name: Option<String>,
        page_id: Option<String>,
    ) -> Result<InstanceInfo> {
        ask!(self, InstantiateBlock { type_key: type_key.to_string(), name: name, page_id: page_id })?
    }

    pub async fn delete_block(&self, instance: &str) -> Result<()> {
        ask!(self, DeleteBlock { instance: instance.to_string() })?
    }

    pub async fn set_enabled(&self, instance: &str, enabled: bool) -> Result<()> {
        ask!(self, SetEnabled { instance: instance.to_string(), enabled: enabled })?
    }

    pub async fn bind(
        &self,
        instance: &str,
        port: &str,
        direction: Direction,
        address: &str,
        auto_create: bool,
    ) -> Result<AddressKey> {
        ask!(self, Bind {
            instance: instance.to_string(),
            port: port.to_string(),
            direction: direction,
            address: address.to_string(),
            auto_create: auto_create,
        })?
    }

    pub async fn unbind(&self, instance: &str, port: &str, direction: Direction) -> Result<()> {
        ask!(self, Unbind { instance: instance.to_string(), port: port.to_string(), direction: direction })?
    }

    pub async fn set_input(&self, instance: &str, port: &str, value: Value) -> Result<()> {
        ask!(self, SetInput { instance: instance.to_string(), port: port.to_string(), value: value })?
    }

    pub async fn trigger_block(&self, instance: &str) -> Result<()> {
        ask!(self, TriggerBlock { instance: instance.to_string() })?
    }

    pub async fn list_blocks(&self) -> Result<Vec<InstanceInfo>> {
        ask!(self, ListBlocks {})
    }

    pub async fn list_types(&self) -> Result<Vec<BlockDescriptor>> {
        ask!(self, ListTypes {})
    }

    pub async fn reload_custom_blocks(&self) -> Result<LoadReport> {
        ask!(self, ReloadCustomBlocks {})
    }

    pub async fn create_page(&self, page: Page) -> Result<Page> {
        ask!(self, CreatePage { page: page })?
    }

    pub async fn update_page(
        &self,
        id: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Page> {
        ask!(self, UpdatePage { id: id.to_string(), name: name, description: description })?
    }

    pub async fn delete_page(&self, id: &str) -> Result<()> {
        ask!(self, DeletePage { id: id.to_string() })?
    }

    pub async fn list_pages(&self) -> Result<Vec<Page>> {
        ask!(self, ListPages {})
    }

    pub async fn get_positions(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        ask!(self, GetPositions {})
    }

    pub async fn set_positions(
        &self,
        positions: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        ask!(self, SetPositions { positions: positions })
    }

    pub async fn export_backup(&self) -> Result<Backup> {
        ask!(self, ExportBackup {})?
    }

    pub async fn import_backup(&self, backup: Backup) -> Result<()> {
        ask!(self, ImportBackup { backup: Box::new(backup) })?
    }

    pub async fn checkpoint(&self) -> Result<()> {
        ask!(self, Checkpoint {})?
    }

    pub async fn shutdown(&self) -> Result<()> {
        ask!(self, Shutdown {})
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instance state and snapshots
// ─────────────────────────────────────────────────────────────────────────────

struct Instance {
    id: String,
    descriptor: Arc<BlockDescriptor>,
    block: Box<dyn Block>,
    name: Option<String>,
    page_id: Option<String>,
    enabled: bool,
    lifecycle: Lifecycle,
    disabled_reason: Option<String>,
    inputs: BTreeMap<String, Value>,
    outputs: BTreeMap<String, Value>,
    debug: VecDeque<(String, String)>,
    periodic: Option<Duration>,
    next_due: Option<Instant>,
    failures: VecDeque<Instant>,
    timed_out: bool,
    last_executed: Option<DateTime<Utc>>,
}

impl Instance {
    fn new(id: String, descriptor: Arc<BlockDescriptor>, block: Box<dyn Block>) -> Self {
        let inputs = descriptor
            .inputs
            .iter()
            .map(|(key, def)| (key.clone(), def.fallback()))
            .collect();
        Self {
            id,
            descriptor,
            block,
            name: None,
            page_id: None,
            enabled: true,
            lifecycle: Lifecycle::Restoring,
            disabled_reason: None,
            inputs,
            outputs: BTreeMap::new(),
            debug: VecDeque::new(),
            periodic: None,
            next_due: None,
            failures: VecDeque::new(),
            timed_out: false,
            last_executed: None,
        }
    }

    fn triggerable(&self) -> bool {
        self.enabled && self.lifecycle != Lifecycle::Disabled
    }
}

/// One port of an instance as the API sees it.
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub def: Option<PortDef>,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
}

/// Snapshot of one block instance for listings.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub block_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    pub enabled: bool,
    pub unloadable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    pub timed_out: bool,
    pub inputs: BTreeMap<String, PortInfo>,
    pub outputs: BTreeMap<String, PortInfo>,
    pub debug: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

pub struct RuntimeConfig {
    pub config_path: PathBuf,
    pub custom_blocks_dir: PathBuf,
    pub execute_timeout: Duration,
    pub checkpoint_interval: Duration,
    pub save_debounce: Duration,
}

pub struct Runtime {
    cfg: RuntimeConfig,
    bus: Arc<AddressBus>,
    gateway: Gateway,
    registry: BlockRegistry,
    bindings: BindingTable,
    remanent: RemanentStore,
    addr_db: Option<AddressDb>,

    instances: BTreeMap<String, Instance>,
    unloadable: BTreeMap<String, BlockConfig>,
    unparseable: Vec<serde_json::Value>,
    pages: BTreeMap<String, Page>,
    positions: serde_json::Map<String, serde_json::Value>,

    queue: VecDeque<(String, Trigger)>,
    queued: HashSet<String>,
    instance_seq: u64,

    rx: mpsc::Receiver<Command>,
    knx_rx: mpsc::Receiver<InboundFrame>,
    knx_closed: bool,

    dirty_since: Option<Instant>,
    next_checkpoint: Instant,
    accepting: bool,
}

impl Runtime {
    /// Build the runtime, hydrate persisted state, and spawn the scheduler
    /// task. Returns the command handle and the task's join handle.
    pub fn start(
        cfg: RuntimeConfig,
        bus: Arc<AddressBus>,
        gateway: Gateway,
        registry: BlockRegistry,
        remanent: RemanentStore,
        addr_db: Option<AddressDb>,
        knx_rx: mpsc::Receiver<InboundFrame>,
    ) -> (RuntimeHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let next_checkpoint = Instant::now() + cfg.checkpoint_interval;
        let mut runtime = Runtime {
            cfg,
            bus,
            gateway,
            registry,
            bindings: BindingTable::new(),
            remanent,
            addr_db,
            instances: BTreeMap::new(),
            unloadable: BTreeMap::new(),
            unparseable: Vec::new(),
            pages: BTreeMap::new(),
            positions: serde_json::Map::new(),
            queue: VecDeque::new(),
            queued: HashSet::new(),
            instance_seq: 0,
            rx,
            knx_rx,
            knx_closed: false,
            dirty_since: None,
            next_checkpoint,
            accepting: true,
        };
        let join = tokio::spawn(async move {
            runtime.load();
            runtime.drain();
            runtime.run().await;
        });
        (RuntimeHandle { tx }, join)
    }

    async fn run(&mut self) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        let shutdown = self.handle_command(cmd).await;
                        self.drain();
                        if shutdown {
                            break;
                        }
                    }
                    None => {
                        self.graceful_stop().await;
                        break;
                    }
                },
                frame = self.knx_rx.recv(), if !self.knx_closed => match frame {
                    Some(frame) => {
                        self.handle_inbound(frame);
                        self.drain();
                    }
                    None => self.knx_closed = true,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.handle_timers();
                    self.drain();
                }
            }
        }
        info!("scheduler stopped");
    }

    fn next_deadline(&self) -> tokio::time::Instant {
        if !self.queue.is_empty() {
            // leftover work from a budget-bounded drain pass
            return tokio::time::Instant::from_std(Instant::now());
        }
        let mut next = self.next_checkpoint;
        if let Some(dirty) = self.dirty_since {
            next = next.min(dirty + self.cfg.save_debounce);
        }
        for inst in self.instances.values() {
            if let Some(due) = inst.next_due {
                if inst.triggerable() {
                    next = next.min(due);
                }
            }
        }
        tokio::time::Instant::from_std(next.max(Instant::now()))
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();

        let mut due = Vec::new();
        for (id, inst) in &mut self.instances {
            if let (Some(interval), Some(at)) = (inst.periodic, inst.next_due) {
                if at <= now && inst.triggerable() {
                    inst.next_due = Some(now + interval);
                    due.push(id.clone());
                }
            }
        }
        // Periodic triggers join the tail of the run queue.
        for id in due {
            self.enqueue(&id, Trigger::Periodic);
        }

        if self
            .dirty_since
            .is_some_and(|since| since + self.cfg.save_debounce <= now)
        {
            self.save_config();
        }

        if self.next_checkpoint <= now {
            self.next_checkpoint = now + self.cfg.checkpoint_interval;
            if let Err(e) = self.do_checkpoint() {
                warn!(error = %e, "periodic checkpoint failed");
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::WriteAddress { key, value, origin, reply } => {
                let result = self.write_address(&key, value, origin);
                self.drain();
                let _ = reply.send(result);
            }
            Command::CreateAddress { desc, reply } => {
                let result = self.bus.create(desc);
                if let Ok(addr) = &result {
                    self.persist_address(addr.clone()).await;
                }
                let _ = reply.send(result);
            }
            Command::EnsureAddress { desc, reply } => {
                let addr = self.bus.ensure(desc);
                self.persist_address(addr.clone()).await;
                let _ = reply.send(Ok(addr));
            }
            Command::UpdateAddress { key, patch, reply } => {
                let result = AddressKey::parse(&key).and_then(|k| self.bus.update(&k, patch));
                if let Ok(addr) = &result {
                    self.persist_address(addr.clone()).await;
                }
                let _ = reply.send(result);
            }
            Command::DeleteAddress { key, reply } => {
                let _ = reply.send(self.delete_address(&key).await);
            }
            Command::InstantiateBlock { type_key, name, page_id, reply } => {
                let result = self.instantiate_block(&type_key, name, page_id);
                self.drain();
                let _ = reply.send(result);
            }
            Command::DeleteBlock { instance, reply } => {
                let _ = reply.send(self.delete_block(&instance));
            }
            Command::SetEnabled { instance, enabled, reply } => {
                let result = self.set_enabled(&instance, enabled);
                self.drain();
                let _ = reply.send(result);
            }
            Command::Bind { instance, port, direction, address, auto_create, reply } => {
                let result = self.bind(&instance, &port, direction, &address, auto_create);
                self.drain();
                let _ = reply.send(result);
            }
            Command::Unbind { instance, port, direction, reply } => {
                let result = self
                    .bindings
                    .unbind(&instance, &port, direction)
                    .map(|_| self.mark_dirty());
                let _ = reply.send(result);
            }
            Command::SetInput { instance, port, value, reply } => {
                let result = self.set_input(&instance, &port, value);
                self.drain();
                let _ = reply.send(result);
            }
            Command::TriggerBlock { instance, reply } => {
                let result = self.trigger_block(&instance);
                self.drain();
                let _ = reply.send(result);
            }
            Command::ListBlocks { reply } => {
                let _ = reply.send(self.list_blocks());
            }
            Command::ListTypes { reply } => {
                let _ = reply.send(self.registry.list_types());
            }
            Command::ReloadCustomBlocks { reply } => {
                let report = self.reload_custom_blocks();
                self.drain();
                let _ = reply.send(report);
            }
            Command::CreatePage { page, reply } => {
                let result = if self.pages.contains_key(&page.id) {
                    Err(Error::Conflict(format!("page {}", page.id)))
                } else {
                    self.pages.insert(page.id.clone(), page.clone());
                    self.mark_dirty();
                    Ok(page)
                };
                let _ = reply.send(result);
            }
            Command::UpdatePage { id, name, description, reply } => {
                let result = match self.pages.get_mut(&id) {
                    Some(page) => {
                        if let Some(name) = name {
                            page.name = name;
                        }
                        if let Some(description) = description {
                            page.description = description;
                        }
                        Ok(page.clone())
                    }
                    None => Err(Error::NotFound(format!("page {id}"))),
                };
                if result.is_ok() {
                    self.mark_dirty();
                }
                let _ = reply.send(result);
            }
            Command::DeletePage { id, reply } => {
                let _ = reply.send(self.delete_page(&id));
            }
            Command::ListPages { reply } => {
                let _ = reply.send(self.pages.values().cloned().collect());
            }
            Command::GetPositions { reply } => {
                let _ = reply.send(self.positions.clone());
            }
            Command::SetPositions { positions, reply } => {
                self.positions = positions;
                self.mark_dirty();
                let _ = reply.send(());
            }
            Command::ExportBackup { reply } => {
                let _ = reply.send(self.export_backup());
            }
            Command::ImportBackup { backup, reply } => {
                let result = self.import_backup(*backup).await;
                self.drain();
                let _ = reply.send(result);
            }
            Command::Checkpoint { reply } => {
                let _ = reply.send(self.do_checkpoint());
            }
            Command::Shutdown { reply } => {
                self.graceful_stop().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn graceful_stop(&mut self) {
        info!("scheduler shutting down");
        self.accepting = false;
        self.drain();
        if let Err(e) = self.do_checkpoint() {
            warn!(error = %e, "final checkpoint failed");
        }
        if self.dirty_since.is_some() {
            self.save_config();
        }
        if let Some(db) = &self.addr_db {
            db.close().await;
        }
    }

    // ── Address operations ──────────────────────────────────────────────────

    fn write_address(&mut self, key: &str, value: Value, origin: Origin) -> Result<Option<Telegram>> {
        let key = AddressKey::parse(key)?;
        let telegram = self.gateway.send(&key, value, origin)?;
        if let Some(t) = &telegram {
            self.persist_value(&key, t);
            self.route_telegram(t);
        }
        Ok(telegram)
    }

    async fn delete_address(&mut self, key: &str) -> Result<()> {
        let key = AddressKey::parse(key)?;
        if self.bindings.references(&key) {
            return Err(Error::InUse(key.to_string()));
        }
        self.bus.delete(&key)?;
        if let Some(db) = &self.addr_db {
            db.delete(&key).await?;
        }
        Ok(())
    }

    async fn persist_address(&self, addr: Address) {
        if let Some(db) = &self.addr_db {
            if let Err(e) = db.upsert(addr).await {
                warn!(error = %e, "address upsert failed, in-memory state stays authoritative");
            }
        }
    }

    fn persist_value(&self, key: &AddressKey, telegram: &Telegram) {
        if let Some(db) = &self.addr_db {
            // The record may not exist yet when an IKO was materialised on
            // first write; the update is a no-op then and the next upsert
            // catches up.
            db.update_value(key, &telegram.new_value, telegram.timestamp);
        }
    }

    fn handle_inbound(&mut self, frame: InboundFrame) {
        let key = AddressKey::Group(frame.address);
        let record = match self.bus.get(&key) {
            Ok(record) => record,
            Err(_) => {
                debug!(address = %key, "telegram for unknown group address ignored");
                return;
            }
        };
        let value = match record.dpt.as_deref() {
            Some(dpt) => match dpt::decode(&frame.payload, dpt) {
                Some(value) => value,
                None => {
                    warn!(address = %key, dpt, "payload not decodable, ignoring");
                    return;
                }
            },
            None => fallback_decode(&frame.payload),
        };
        match self.bus.write(&key, value, Origin::KnxIn) {
            Ok(Some(t)) => {
                self.persist_value(&key, &t);
                self.route_telegram(&t);
            }
            Ok(None) => {}
            Err(e) => warn!(address = %key, error = %e, "inbound write rejected"),
        }
    }

    // ── Triggering and execution ────────────────────────────────────────────

    fn enqueue(&mut self, instance: &str, trigger: Trigger) {
        if !self.accepting {
            return;
        }
        // Coalescing: one pending run per instance; the queued run reads the
        // latest input values when it executes.
        if self.queued.contains(instance) {
            return;
        }
        match self.instances.get(instance) {
            Some(inst) if inst.triggerable() => {
                self.queued.insert(instance.to_string());
                self.queue.push_back((instance.to_string(), trigger));
            }
            _ => {}
        }
    }

    /// Run the queue towards quiescence, FIFO in arrival order. Executions
    /// may enqueue further work; a bounded budget per pass keeps the command
    /// channel live even under a pathological trigger storm.
    fn drain(&mut self) {
        for _ in 0..DRAIN_BUDGET {
            let Some((id, trigger)) = self.queue.pop_front() else {
                return;
            };
            self.queued.remove(&id);
            self.execute_instance(&id, trigger);
        }
        if !self.queue.is_empty() {
            warn!(pending = self.queue.len(), "drain budget exhausted, resuming next tick");
        }
    }

    fn execute_instance(&mut self, id: &str, trigger: Trigger) {
        let (result, effects, elapsed, descriptor) = {
            let Some(inst) = self.instances.get_mut(id) else {
                return;
            };
            if !inst.triggerable() {
                return;
            }
            inst.lifecycle = Lifecycle::Executing;
            let descriptor = Arc::clone(&inst.descriptor);
            let inputs = inst.inputs.clone();
            let started = Instant::now();
            let mut ctx = BlockCtx::new(id, &descriptor, &inputs, trigger.clone());
            let result = inst.block.execute(&mut ctx);
            (result, ctx.finish(), started.elapsed(), descriptor)
        };

        // Post-execution bookkeeping under a fresh borrow.
        {
            let inst = self.instances.get_mut(id).expect("instance present");
            inst.lifecycle = Lifecycle::Ready;
            inst.last_executed = Some(Utc::now());

            if elapsed > self.cfg.execute_timeout {
                warn!(instance = id, elapsed_ms = elapsed.as_millis() as u64,
                    "block exceeded the execute timeout");
                inst.timed_out = true;
            }

            for (key, value) in effects.debug {
                if inst.debug.len() == DEBUG_RING_CAPACITY {
                    inst.debug.pop_front();
                }
                inst.debug.push_back((key, value));
            }

            if let Some(interval) = effects.interval {
                inst.periodic = interval;
                inst.next_due = interval.map(|d| Instant::now() + d);
            }
        }

        if let Err(e) = result {
            // A failing block never destabilises the runtime: outputs stay at
            // their prior values and the failure is counted.
            error!(instance = id, trigger = %trigger, error = %e, "block execution failed");
            self.record_failure(id);
            return;
        }

        // Apply output writes in order; each may fan out into further
        // triggers, which the drain loop picks up afterwards.
        for (port, value) in effects.outputs {
            let Some(def) = descriptor.output(&port) else {
                warn!(instance = id, port, "write to undeclared output ignored");
                continue;
            };
            let coerced = match value.coerce(def.ty) {
                Ok(v) => v,
                Err(e) => {
                    warn!(instance = id, port, error = %e, "output not coercible, ignored");
                    continue;
                }
            };
            if let Some(inst) = self.instances.get_mut(id) {
                inst.outputs.insert(port.clone(), coerced.clone());
            }
            let binding = self.bindings.resolve(id, &port, Direction::Output).cloned();
            if let Some(key) = binding {
                match self.gateway.send(&key, coerced, Origin::BlockOut) {
                    Ok(Some(t)) => {
                        self.persist_value(&key, &t);
                        self.route_telegram(&t);
                    }
                    Ok(None) => {} // unchanged value suppressed, cycle broken
                    Err(e) => {
                        warn!(instance = id, port, address = %key, error = %e,
                            "output write failed");
                    }
                }
            }
        }
        self.mark_dirty();
    }

    fn record_failure(&mut self, id: &str) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        let now = Instant::now();
        inst.failures.push_back(now);
        while inst
            .failures
            .front()
            .is_some_and(|t| now.duration_since(*t) > FAILURE_WINDOW)
        {
            inst.failures.pop_front();
        }
        if inst.failures.len() >= FAILURE_LIMIT {
            error!(instance = id, "repeated failures, disabling instance");
            inst.lifecycle = Lifecycle::Disabled;
            inst.disabled_reason = Some("repeated-failures".to_string());
        }
    }

    /// Route a telegram to every input port bound to its address.
    fn route_telegram(&mut self, telegram: &Telegram) {
        let Ok(key) = AddressKey::parse(&telegram.address) else {
            return;
        };
        for (instance, port) in self.bindings.subscribers_of(&key) {
            self.deliver_input(&instance, &port, telegram.new_value.clone());
        }
    }

    /// Deliver a value to one input port. Triggers the block only when the
    /// coerced value differs from the previously delivered one.
    fn deliver_input(&mut self, instance: &str, port: &str, value: Value) {
        let changed = {
            let Some(inst) = self.instances.get_mut(instance) else {
                return; // unloadable instances keep their bindings but never run
            };
            let Some(def) = inst.descriptor.input(port).cloned() else {
                debug!(instance, port, "value for undeclared input dropped");
                return;
            };
            let coerced = match value.coerce(def.ty) {
                Ok(v) => v,
                Err(e) => {
                    warn!(instance, port, error = %e, "input not coercible, dropped");
                    return;
                }
            };
            let previous = inst.inputs.get(port).cloned().unwrap_or_else(|| def.fallback());
            let changed = !Value::coerced_eq(&previous, &coerced, def.ty);
            inst.inputs.insert(port.to_string(), coerced);
            changed
        };
        if changed {
            self.mark_dirty();
            self.enqueue(instance, Trigger::Input(port.to_string()));
        }
    }

    fn set_input(&mut self, instance: &str, port: &str, value: Value) -> Result<()> {
        if self.unloadable.contains_key(instance) {
            return Err(Error::UnknownType(instance.to_string()));
        }
        let inst = self
            .instances
            .get(instance)
            .ok_or_else(|| Error::NotFound(instance.to_string()))?;
        if inst.descriptor.input(port).is_none() {
            return Err(Error::UnknownPort(format!("{instance}.{port}")));
        }
        self.deliver_input(instance, port, value);
        Ok(())
    }

    fn trigger_block(&mut self, instance: &str) -> Result<()> {
        if self.unloadable.contains_key(instance) {
            return Err(Error::UnknownType(instance.to_string()));
        }
        let inst = self
            .instances
            .get(instance)
            .ok_or_else(|| Error::NotFound(instance.to_string()))?;
        if !inst.triggerable() {
            return Err(Error::Conflict(format!("{instance} is disabled")));
        }
        self.enqueue(instance, Trigger::Manual);
        Ok(())
    }

    // ── Instance management ─────────────────────────────────────────────────

    fn instantiate_block(
        &mut self,
        type_key: &str,
        name: Option<String>,
        page_id: Option<String>,
    ) -> Result<InstanceInfo> {
        let (descriptor, block) = self.registry.instantiate(type_key)?;
        let id = loop {
            self.instance_seq += 1;
            let id = format!(
                "{}_{}_{}_{}",
                descriptor.id,
                type_key,
                self.instance_seq,
                Utc::now().format("%H%M%S")
            );
            if !self.instances.contains_key(&id) && !self.unloadable.contains_key(&id) {
                break id;
            }
        };
        let mut inst = Instance::new(id.clone(), Arc::new(descriptor), block);
        inst.name = name;
        inst.page_id = page_id;
        inst.lifecycle = Lifecycle::Ready;
        self.instances.insert(id.clone(), inst);
        self.enqueue(&id, Trigger::Initial);
        self.mark_dirty();
        info!(instance = %id, type_key, "block instantiated");
        Ok(self.instance_info(&id).expect("just inserted"))
    }

    fn delete_block(&mut self, instance: &str) -> Result<()> {
        let existed =
            self.instances.remove(instance).is_some() || self.unloadable.remove(instance).is_some();
        if !existed {
            return Err(Error::NotFound(instance.to_string()));
        }
        self.bindings.remove_instance(instance);
        self.remanent.remove(instance);
        self.queued.remove(instance);
        self.queue.retain(|(id, _)| id != instance);
        self.mark_dirty();
        info!(instance, "block deleted");
        Ok(())
    }

    fn set_enabled(&mut self, instance: &str, enabled: bool) -> Result<()> {
        if let Some(cfg) = self.unloadable.get_mut(instance) {
            cfg.enabled = enabled;
            self.mark_dirty();
            return Ok(());
        }
        let inst = self
            .instances
            .get_mut(instance)
            .ok_or_else(|| Error::NotFound(instance.to_string()))?;
        inst.enabled = enabled;
        if enabled {
            inst.lifecycle = Lifecycle::Ready;
            inst.disabled_reason = None;
            inst.failures.clear();
            inst.timed_out = false;
            self.enqueue(instance, Trigger::Initial);
        } else {
            inst.lifecycle = Lifecycle::Disabled;
            inst.disabled_reason = Some("administrative".to_string());
        }
        self.mark_dirty();
        Ok(())
    }

    // ── Binding ─────────────────────────────────────────────────────────────

    fn bind(
        &mut self,
        instance: &str,
        port: &str,
        direction: Direction,
        address: &str,
        auto_create: bool,
    ) -> Result<AddressKey> {
        let key = match AddressSpec::parse(address)? {
            AddressSpec::Key(key) => key,
            AddressSpec::Block(source) => {
                if direction != Direction::Input {
                    return Err(Error::InvalidAddress(
                        "BLOCK: shorthand is input-only".to_string(),
                    ));
                }
                self.materialize_block_ref(&source.instance, &source.port)?
            }
        };

        // Port validation. For unloadable instances user intent wins: the
        // binding is accepted with a warning so it survives type repairs.
        if let Some(inst) = self.instances.get(instance) {
            if !inst.descriptor.has_port(port, direction) {
                return Err(Error::UnknownPort(format!("{instance}.{port}")));
            }
        } else if self.unloadable.contains_key(instance) {
            warn!(instance, port, "binding accepted for unloadable instance");
        } else {
            return Err(Error::NotFound(instance.to_string()));
        }

        if !self.bus.contains(&key) {
            if auto_create || key.is_internal() {
                self.bus.ensure(AddressDescriptor::auto(&key));
            } else {
                return Err(Error::NotFound(key.to_string()));
            }
        }

        self.bindings.bind(instance, port, direction, key.clone())?;
        self.mark_dirty();
        debug!(instance, port, ?direction, address = %key, "bound");

        // Initial sync so the new wiring reflects current state immediately.
        match direction {
            Direction::Input => {
                if let Ok(addr) = self.bus.get(&key) {
                    if !addr.last_value.is_null() {
                        self.deliver_input(instance, port, addr.last_value);
                    }
                }
            }
            Direction::Output => {
                // Runtime-generated sync, not a real execution, hence the
                // iko-internal origin (same unchanged-value suppression).
                let current = self
                    .instances
                    .get(instance)
                    .and_then(|i| i.outputs.get(port).cloned());
                if let Some(value) = current.filter(|v| !v.is_null()) {
                    match self.gateway.send(&key, value, Origin::IkoInternal) {
                        Ok(Some(t)) => {
                            self.persist_value(&key, &t);
                            self.route_telegram(&t);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(instance, port, error = %e, "initial output write failed"),
                    }
                }
            }
        }

        Ok(key)
    }

    /// Expand `BLOCK:<instance>:<port>`: reuse the address already owning
    /// that source output — output writes route to input subscribers no
    /// matter whether the address is an IKO or an external group address —
    /// otherwise derive an IKO, create it, and bind the source output to it.
    /// This dedup is what keeps one output feeding many inputs through a
    /// single address.
    fn materialize_block_ref(&mut self, source: &str, source_port: &str) -> Result<AddressKey> {
        let source_inst = self
            .instances
            .get(source)
            .ok_or_else(|| Error::NotFound(format!("source block {source}")))?;
        if source_inst.descriptor.output(source_port).is_none() {
            return Err(Error::UnknownPort(format!("{source}.{source_port}")));
        }

        if let Some(existing) = self.bindings.resolve(source, source_port, Direction::Output) {
            return Ok(existing.clone());
        }

        let type_key = source_inst.descriptor.type_key.clone();
        let key = derive_iko_key(source, &type_key, source_port);
        let mut desc = AddressDescriptor::new(key.clone(), format!("{type_key}.{source_port}"));
        desc.group_label = Some(type_key);
        self.bus.ensure(desc);

        self.bindings.bind(source, source_port, Direction::Output, key.clone())?;
        // Push the source's current output through the fresh IKO.
        let current = self
            .instances
            .get(source)
            .and_then(|i| i.outputs.get(source_port).cloned());
        if let Some(value) = current.filter(|v| !v.is_null()) {
            if let Ok(Some(t)) = self.gateway.send(&key, value, Origin::IkoInternal) {
                self.persist_value(&key, &t);
                self.route_telegram(&t);
            }
        }
        self.mark_dirty();
        Ok(key)
    }

    // ── Pages ───────────────────────────────────────────────────────────────

    fn delete_page(&mut self, id: &str) -> Result<()> {
        if self.pages.remove(id).is_none() {
            return Err(Error::NotFound(format!("page {id}")));
        }
        let on_page: Vec<String> = self
            .instances
            .values()
            .filter(|i| i.page_id.as_deref() == Some(id))
            .map(|i| i.id.clone())
            .chain(
                self.unloadable
                    .values()
                    .filter(|c| c.page_id.as_deref() == Some(id))
                    .map(|c| c.instance_id.clone()),
            )
            .collect();
        for instance in on_page {
            let _ = self.delete_block(&instance);
        }
        self.mark_dirty();
        Ok(())
    }

    // ── Snapshots ───────────────────────────────────────────────────────────

    fn list_blocks(&self) -> Vec<InstanceInfo> {
        let mut out: Vec<InstanceInfo> = self
            .instances
            .keys()
            .filter_map(|id| self.instance_info(id))
            .collect();
        out.extend(self.unloadable.values().map(|cfg| self.unloadable_info(cfg)));
        out
    }

    fn instance_info(&self, id: &str) -> Option<InstanceInfo> {
        let inst = self.instances.get(id)?;
        let (input_bindings, output_bindings) = self.bindings.bindings_of(id);
        let inputs = inst
            .descriptor
            .inputs
            .iter()
            .map(|(port, def)| {
                (
                    port.clone(),
                    PortInfo {
                        def: Some(def.clone()),
                        value: inst.inputs.get(port).cloned().unwrap_or(Value::Null),
                        binding: input_bindings.get(port).cloned(),
                    },
                )
            })
            .collect();
        let outputs = inst
            .descriptor
            .outputs
            .iter()
            .map(|(port, def)| {
                (
                    port.clone(),
                    PortInfo {
                        def: Some(def.clone()),
                        value: inst.outputs.get(port).cloned().unwrap_or(Value::Null),
                        binding: output_bindings.get(port).cloned(),
                    },
                )
            })
            .collect();
        Some(InstanceInfo {
            instance_id: inst.id.clone(),
            block_type: inst.descriptor.type_key.clone(),
            name: inst.name.clone(),
            page_id: inst.page_id.clone(),
            enabled: inst.enabled,
            unloadable: false,
            lifecycle: Some(inst.lifecycle),
            disabled_reason: inst.disabled_reason.clone(),
            timed_out: inst.timed_out,
            inputs,
            outputs,
            debug: inst.debug.iter().cloned().collect(),
            last_executed: inst.last_executed,
        })
    }

    fn unloadable_info(&self, cfg: &BlockConfig) -> InstanceInfo {
        let (input_bindings, output_bindings) = self.bindings.bindings_of(&cfg.instance_id);
        let port_infos = |values: &BTreeMap<String, Value>,
                          bindings: &BTreeMap<String, String>| {
            let mut ports: BTreeMap<String, PortInfo> = values
                .iter()
                .map(|(port, value)| {
                    (
                        port.clone(),
                        PortInfo {
                            def: None,
                            value: value.clone(),
                            binding: bindings.get(port).cloned(),
                        },
                    )
                })
                .collect();
            for (port, address) in bindings {
                ports.entry(port.clone()).or_insert_with(|| PortInfo {
                    def: None,
                    value: Value::Null,
                    binding: Some(address.clone()),
                });
            }
            ports
        };
        InstanceInfo {
            instance_id: cfg.instance_id.clone(),
            block_type: cfg.block_type.clone(),
            name: cfg.name.clone(),
            page_id: cfg.page_id.clone(),
            enabled: cfg.enabled,
            unloadable: true,
            lifecycle: None,
            disabled_reason: Some("unknown-type".to_string()),
            timed_out: false,
            inputs: port_infos(&cfg.input_values, &input_bindings),
            outputs: port_infos(&cfg.output_values, &output_bindings),
            debug: Vec::new(),
            last_executed: None,
        }
    }

    // ── Custom block reload ─────────────────────────────────────────────────

    fn reload_custom_blocks(&mut self) -> LoadReport {
        let report = self.registry.load_from_path(&self.cfg.custom_blocks_dir);

        // Custom types that vanished demote their live instances to retained
        // placeholders — config, bindings and remanent state all survive so
        // re-uploading the type repairs them in place.
        let vanished: Vec<String> = self
            .instances
            .values()
            .filter(|i| {
                !i.descriptor.builtin && self.registry.resolve(&i.descriptor.type_key).is_none()
            })
            .map(|i| i.id.clone())
            .collect();
        for id in vanished {
            if let Some(inst) = self.instances.remove(&id) {
                warn!(instance = %id, type_key = %inst.descriptor.type_key,
                    "type no longer available, retaining instance as unloadable");
                let (input_bindings, output_bindings) = self.bindings.bindings_of(&id);
                self.unloadable.insert(
                    id.clone(),
                    BlockConfig {
                        instance_id: id.clone(),
                        block_type: inst.descriptor.type_key.clone(),
                        name: inst.name,
                        page_id: inst.page_id,
                        enabled: inst.enabled,
                        input_values: inst.inputs,
                        output_values: inst.outputs,
                        input_bindings,
                        output_bindings,
                        extra: serde_json::Map::new(),
                    },
                );
                self.queued.remove(&id);
                self.queue.retain(|(queued, _)| queued != &id);
            }
        }

        // Restart running instances of reloaded types in place, keeping
        // bindings, input values and remanent state.
        let to_restart: Vec<String> = self
            .instances
            .values()
            .filter(|i| report.loaded.contains(&i.descriptor.type_key))
            .map(|i| i.id.clone())
            .collect();
        for id in to_restart {
            if let Err(e) = self.restart_instance(&id) {
                warn!(instance = %id, error = %e, "restart after reload failed");
            }
        }

        // Types that just appeared may make retained instances loadable.
        let now_loadable: Vec<String> = self
            .unloadable
            .values()
            .filter(|cfg| self.registry.resolve(&cfg.block_type).is_some())
            .map(|cfg| cfg.instance_id.clone())
            .collect();
        for id in now_loadable {
            if let Some(cfg) = self.unloadable.remove(&id) {
                info!(instance = %id, type_key = %cfg.block_type, "retained instance is loadable again");
                self.hydrate_instance(&cfg, false);
            }
        }
        self.mark_dirty();
        report
    }

    fn restart_instance(&mut self, id: &str) -> Result<()> {
        let (type_key, saved_state) = {
            let inst = self
                .instances
                .get(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            (inst.descriptor.type_key.clone(), inst.block.state())
        };
        let (descriptor, mut block) = self.registry.instantiate(&type_key)?;
        if descriptor.remanent {
            if let Some(state) = saved_state {
                block.restore(state);
            }
        }
        let inst = self.instances.get_mut(id).expect("checked above");
        let descriptor = Arc::new(descriptor);
        // Re-coerce kept input values against the (possibly changed) schema.
        let mut inputs = BTreeMap::new();
        for (port, def) in &descriptor.inputs {
            let value = inst
                .inputs
                .get(port)
                .and_then(|v| v.coerce(def.ty).ok())
                .unwrap_or_else(|| def.fallback());
            inputs.insert(port.clone(), value);
        }
        inst.descriptor = descriptor;
        inst.block = block;
        inst.inputs = inputs;
        inst.outputs.clear();
        inst.periodic = None;
        inst.next_due = None;
        inst.failures.clear();
        inst.timed_out = false;
        if inst.enabled {
            inst.lifecycle = Lifecycle::Ready;
        }
        info!(instance = id, "instance restarted with reloaded type");
        self.enqueue(id, Trigger::Initial);
        Ok(())
    }

    // ── Persistence orchestration ───────────────────────────────────────────

    fn mark_dirty(&mut self) {
        if self.dirty_since.is_none() {
            self.dirty_since = Some(Instant::now());
        }
    }

    fn load(&mut self) {
        let config = match load_config(&self.cfg.config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %self.cfg.config_path.display(), error = %e,
                    "logic config unreadable, starting fresh without overwriting it");
                return;
            }
        };
        let loaded_repr = serde_json::to_value(&config).ok();

        for page in &config.pages {
            self.pages.insert(page.id.clone(), page.clone());
        }
        self.positions = config.positions.clone();

        let (blocks, unparseable) = config.parse_blocks();
        self.unparseable = unparseable;
        for cfg in &blocks {
            self.hydrate_instance(cfg, true);
        }
        info!(
            blocks = self.instances.len(),
            unloadable = self.unloadable.len(),
            pages = self.pages.len(),
            "logic config loaded"
        );

        // Initial input sync from the bus, then the initial execution round.
        let sync: Vec<(String, String, Value)> = self
            .instances
            .keys()
            .flat_map(|id| {
                let (input_bindings, _) = self.bindings.bindings_of(id);
                input_bindings
                    .into_iter()
                    .filter_map(|(port, address)| {
                        let key = AddressKey::parse(&address).ok()?;
                        let value = self.bus.get(&key).ok()?.last_value;
                        (!value.is_null()).then(|| (id.clone(), port, value))
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        for (id, port, value) in sync {
            self.deliver_input(&id, &port, value);
        }

        let ids: Vec<String> = self.instances.keys().cloned().collect();
        for id in ids {
            self.enqueue(&id, Trigger::Initial);
        }

        // Re-save only when the in-memory representation differs from the
        // file, e.g. after schema evolution.
        if let (Some(loaded), Ok(current)) =
            (loaded_repr, serde_json::to_value(self.current_config()))
        {
            if loaded != current {
                self.mark_dirty();
            }
        }
    }

    /// Bring one persisted block config to life — or retain it as an
    /// unloadable placeholder when its type is unknown. Never drops anything.
    fn hydrate_instance(&mut self, cfg: &BlockConfig, register_bindings: bool) {
        match self.registry.instantiate(&cfg.block_type) {
            Ok((descriptor, mut block)) => {
                let descriptor = Arc::new(descriptor);
                if descriptor.remanent {
                    if let Some(state) = self.remanent.restore(&cfg.instance_id) {
                        block.restore(state.clone());
                        debug!(instance = %cfg.instance_id, "remanent state restored");
                    }
                }
                let mut inst = Instance::new(cfg.instance_id.clone(), descriptor, block);
                inst.name = cfg.name.clone();
                inst.page_id = cfg.page_id.clone();
                inst.enabled = cfg.enabled;
                if !cfg.enabled {
                    inst.lifecycle = Lifecycle::Disabled;
                    inst.disabled_reason = Some("administrative".to_string());
                }
                for (port, value) in &cfg.input_values {
                    match inst.descriptor.input(port) {
                        Some(def) => {
                            if let Ok(coerced) = value.coerce(def.ty) {
                                inst.inputs.insert(port.clone(), coerced);
                            }
                        }
                        None => warn!(instance = %cfg.instance_id, port,
                            "stored value for unknown input kept out of the schema"),
                    }
                }
                for (port, value) in &cfg.output_values {
                    if inst.descriptor.output(port).is_some() {
                        inst.outputs.insert(port.clone(), value.clone());
                    }
                }
                if inst.enabled {
                    inst.lifecycle = Lifecycle::Ready;
                }
                self.instances.insert(cfg.instance_id.clone(), inst);
                if register_bindings {
                    self.register_config_bindings(cfg, false);
                }
            }
            Err(_) => {
                warn!(instance = %cfg.instance_id, type_key = %cfg.block_type,
                    "unknown block type, retaining instance as unloadable");
                if register_bindings {
                    self.register_config_bindings(cfg, true);
                }
                self.unloadable.insert(cfg.instance_id.clone(), cfg.clone());
            }
        }
    }

    fn register_config_bindings(&mut self, cfg: &BlockConfig, unloadable: bool) {
        let sets = [
            (Direction::Input, &cfg.input_bindings),
            (Direction::Output, &cfg.output_bindings),
        ];
        for (direction, bindings) in sets {
            for (port, address) in bindings {
                let key = match AddressKey::parse(address) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(instance = %cfg.instance_id, port, address, error = %e,
                            "skipping binding with invalid address");
                        continue;
                    }
                };
                // Unknown ports of a loadable block are warnings, not errors;
                // the binding stays registered so intent survives.
                if !unloadable {
                    if let Some(inst) = self.instances.get(&cfg.instance_id) {
                        if !inst.descriptor.has_port(port, direction) {
                            warn!(instance = %cfg.instance_id, port,
                                "binding references a port the type does not declare");
                        }
                    }
                }
                // Every binding must point at an existing address.
                if !self.bus.contains(&key) {
                    self.bus.ensure(AddressDescriptor::auto(&key));
                }
                if let Err(e) = self
                    .bindings
                    .bind(&cfg.instance_id, port, direction, key)
                {
                    warn!(instance = %cfg.instance_id, port, error = %e, "binding not restored");
                }
            }
        }
    }

    fn current_config(&self) -> LogicConfig {
        let mut config = LogicConfig {
            pages: self.pages.values().cloned().collect(),
            blocks: Vec::new(),
            positions: self.positions.clone(),
            extra: serde_json::Map::new(),
        };
        for inst in self.instances.values() {
            let (input_bindings, output_bindings) = self.bindings.bindings_of(&inst.id);
            config.push_block(&BlockConfig {
                instance_id: inst.id.clone(),
                block_type: inst.descriptor.type_key.clone(),
                name: inst.name.clone(),
                page_id: inst.page_id.clone(),
                enabled: inst.enabled,
                input_values: inst.inputs.clone(),
                output_values: inst.outputs.clone(),
                input_bindings,
                output_bindings,
                extra: serde_json::Map::new(),
            });
        }
        // Unloadable and unparseable entries ride along verbatim.
        for cfg in self.unloadable.values() {
            config.push_block(cfg);
        }
        config.blocks.extend(self.unparseable.iter().cloned());
        config
    }

    fn save_config(&mut self) {
        self.dirty_since = None;
        let config = self.current_config();
        match save_config_atomic(&self.cfg.config_path, &config) {
            Ok(()) => debug!(
                blocks = config.blocks.len(),
                "logic config saved"
            ),
            Err(e) => {
                // In-memory state stays authoritative; retry on the next change.
                error!(error = %e, "logic config save failed");
                self.dirty_since = Some(Instant::now());
            }
        }
    }

    fn do_checkpoint(&mut self) -> Result<()> {
        for inst in self.instances.values() {
            if inst.descriptor.remanent {
                if let Some(state) = inst.block.state() {
                    self.remanent.store(&inst.id, state);
                }
            }
        }
        self.remanent.save()
    }

    // ── Backup ──────────────────────────────────────────────────────────────

    fn export_backup(&self) -> Result<Backup> {
        let mut custom_blocks = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(&self.cfg.custom_blocks_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                    if let (Some(name), Ok(source)) = (
                        path.file_name().and_then(|n| n.to_str()),
                        std::fs::read_to_string(&path),
                    ) {
                        custom_blocks.insert(name.to_string(), source);
                    }
                }
            }
        }
        Ok(Backup {
            addresses: self.bus.list(&AddressFilter::default()),
            logic: self.current_config(),
            remanent: self.remanent.entries().clone(),
            custom_blocks,
        })
    }

    async fn import_backup(&mut self, backup: Backup) -> Result<()> {
        info!(
            addresses = backup.addresses.len(),
            blocks = backup.logic.blocks.len(),
            "importing backup"
        );

        // Module filenames go through the same validation as an upload, and
        // all of them before anything is written — a bad name rejects the
        // document instead of silently dropping a type mid-restore.
        let mut module_files = Vec::new();
        for (name, source) in &backup.custom_blocks {
            module_files.push((crate::blocks::safe_module_name(name)?, source));
        }

        // Custom block sources first so the registry can resolve user types.
        std::fs::create_dir_all(&self.cfg.custom_blocks_dir)?;
        for (name, source) in module_files {
            std::fs::write(self.cfg.custom_blocks_dir.join(name), source)?;
        }
        self.registry.load_from_path(&self.cfg.custom_blocks_dir);

        // Replace the address set.
        self.bus.replace_all(backup.addresses.clone());
        if let Some(db) = &self.addr_db {
            db.clear().await?;
            for addr in backup.addresses {
                db.upsert(addr).await?;
            }
        }

        // Replace logic state.
        self.instances.clear();
        self.unloadable.clear();
        self.bindings = BindingTable::new();
        self.queue.clear();
        self.queued.clear();
        self.pages = backup
            .logic
            .pages
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();
        self.positions = backup.logic.positions.clone();
        self.remanent.replace_all(backup.remanent);

        let (blocks, unparseable) = backup.logic.parse_blocks();
        self.unparseable = unparseable;
        for cfg in &blocks {
            self.hydrate_instance(cfg, true);
        }
        let ids: Vec<String> = self.instances.keys().cloned().collect();
        for id in ids {
            self.enqueue(&id, Trigger::Initial);
        }

        self.remanent.save()?;
        self.save_config();
        Ok(())
    }
}

fn fallback_decode(payload: &[u8]) -> Value {
    match payload {
        [] => Value::Null,
        [b] => Value::Int(*b as i64),
        bytes => Value::Str(bytes.iter().map(|b| format!("{b:02x}")).collect()),
    }
}
