use std::{
    fmt,
    sync::{Arc, Weak},
};

use arc_swap::Guard;
use eyeq_wire::{feedback, Feedback, Packet};
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::{debug, debug_span, trace};

use crate::{
    admin::Command, index::Index, stats::EngineStats, ClassKey, Datapath, Error, Params, Result,
    Transmit, TxClass, Verdict, VirtualQueue, VqSet,
};

/// The isolation engine: the registry of classes and virtual queues, and the entry points of the
/// packet path.
///
/// Packets enter through [`Engine::tx`] on egress and [`Engine::rx`] on ingress, from any number
/// of threads, each identifying itself by a CPU index. Neither ever blocks. Deferred work runs on
/// Tokio tasks spawned by [`Engine::start`].
pub struct Engine<K: ClassKey> {
    dp: Arc<Datapath>,
    classes: Index<K, TxClass<K>>,
    vqs: VqSet<K>,
    refill_tx: mpsc::UnboundedSender<K>,
    refill_rx: Mutex<Option<mpsc::UnboundedReceiver<K>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: ClassKey> fmt::Debug for Engine<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("scheme", &K::SCHEME)
            .field("dp", &self.dp)
            .field("classes", &self.classes.len())
            .field("vqs", &self.vqs.index().len())
            .finish_non_exhaustive()
    }
}

impl<K: ClassKey> Engine<K> {
    /// Creates an engine sending packets through `link`. Nothing runs in the background until
    /// [`Engine::start`] is called.
    pub fn new(params: Params, link: impl Transmit) -> Arc<Self> {
        let dp = Arc::new(Datapath::new(params, link));
        let (refill_tx, refill_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            classes: Index::default(),
            vqs: VqSet::new(dp.now()),
            dp,
            refill_tx,
            refill_rx: Mutex::new(Some(refill_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the per-CPU timer and drain tasks and the pool refill task on the current Tokio
    /// runtime. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        if self.dp.is_shutdown() {
            return Err(Error::Shutdown);
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        for cpu in 0..self.dp.num_cpus() {
            tasks.push(handle.spawn(Arc::clone(&self.dp).run_timer(cpu)));
            tasks.push(handle.spawn(Arc::clone(&self.dp).run_drain(cpu)));
        }

        if let Some(rx) = self.refill_rx.lock().take() {
            tasks.push(handle.spawn(Self::run_refill(Arc::downgrade(self), rx)));
        }

        debug!(scheme = K::SCHEME, cpus = self.dp.num_cpus(), "engine started");
        Ok(())
    }

    async fn run_refill(engine: Weak<Self>, mut rx: mpsc::UnboundedReceiver<K>) {
        while let Some(key) = rx.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };

            if let Some(class) = engine.classes.get(&key) {
                class.refill_pool(engine.dp.now(), &engine.dp.params());
            }
        }

        debug!("refill task stopped");
    }

    /// Stops the engine: raises the shutdown flag, cancels all deferred work, and drops every
    /// queued packet. The packet path passes traffic through from then on.
    pub fn shutdown(&self) {
        self.dp.begin_shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let parked = self.dp.clear_active();
        let dropped: usize = self.classes.values().iter().map(|class| class.flush()).sum();
        debug!(parked, dropped, "engine shut down");
    }

    pub const fn datapath(&self) -> &Arc<Datapath> {
        &self.dp
    }

    pub fn params(&self) -> Guard<Arc<Params>> {
        self.dp.params()
    }

    pub fn class(&self, key: &K) -> Option<Arc<TxClass<K>>> {
        self.classes.get(key)
    }

    pub fn queue(&self, key: &K) -> Option<Arc<VirtualQueue>> {
        self.vqs.get(key)
    }

    pub const fn queues(&self) -> &VqSet<K> {
        &self.vqs
    }

    /// Hands an unprocessed packet to the link.
    fn pass(&self, packet: Packet) -> Verdict {
        self.dp.transmit(packet);
        Verdict::Pass
    }

    /// Hands a packet the engine could not parse to the link.
    fn pass_malformed(&self, packet: Packet) -> Verdict {
        trace!(len = packet.len(), "malformed IPv4 header");
        self.dp.transmit(packet);
        Verdict::Error
    }

    /// Egress path.
    ///
    /// IPv4 packets are limited per destination, other packets by the aggregate limiter of their
    /// class. Packets that cannot be classified, or whose destination state cannot be created
    /// without blocking, are passed through to the link. Unclassified frames with a broken IPv4
    /// header are passed through as well but reported as [`Verdict::Error`].
    pub fn tx(&self, mut packet: Packet, cpu: usize) -> Verdict {
        let params = self.dp.params();
        if !params.enabled || self.dp.is_shutdown() {
            return self.pass(packet);
        }

        let Some(key) = K::classify_tx(&packet) else {
            if packet.is_malformed_ipv4() {
                return self.pass_malformed(packet);
            }
            return self.pass(packet);
        };

        let now = self.dp.now();
        let class = self.classes.try_get_or_insert_with(key, || {
            Some(Arc::new(TxClass::new(key, now, self.dp.num_cpus(), &params, self.refill_tx.clone())))
        });
        let Some(class) = class else {
            return self.pass(packet);
        };

        let rl = match packet.dst_ip() {
            Some(peer) => match class.find_or_create_state(peer, now, &params) {
                Some(state) => Arc::clone(state.rl()),
                None => return self.pass(packet),
            },
            None => Arc::clone(class.agg()),
        };

        // Piggy-back congestion of our own receive side onto outgoing data.
        if let Some(vq) = class.vq().or_else(|| self.vqs.get(&key)) {
            if vq.is_congested(&params) {
                rl.add_feedback_backlog(cpu);
            }
        }

        if self.dp.is_shutdown() {
            return self.pass(packet);
        }

        packet.set_ect();
        rl.enqueue(packet, cpu, now, &self.dp)
    }

    /// Ingress path. Never takes ownership of data packets: the caller delivers them on
    /// [`Verdict::Pass`] and [`Verdict::Error`]. Feedback packets are consumed and reported as
    /// [`Verdict::Drop`].
    pub fn rx(&self, packet: &Packet, cpu: usize) -> Verdict {
        let params = self.dp.params();
        if !params.enabled || self.dp.is_shutdown() {
            return Verdict::Pass;
        }

        let now = self.dp.now();
        if feedback::is_feedback(packet, params.feedback_ipproto) {
            self.on_feedback(packet, cpu, now, &params);
            return Verdict::Drop;
        }

        let Some(key) = K::classify_rx(packet) else {
            if packet.is_malformed_ipv4() {
                return Verdict::Error;
            }
            return Verdict::Pass;
        };

        let vq = self.vqs.index().try_get_or_insert_with(key, || {
            Some(Arc::new(VirtualQueue::new(now, self.dp.num_cpus(), &params)))
        });
        if let Some(vq) = &vq {
            if vq.is_enabled() {
                vq.enqueue(packet, cpu, now, self.vqs.shared(), &params);
            }
        }
        self.vqs.check_idle(now, &params);

        // A reflected data packet is feedback from the peer we send to.
        if let (Some(class), Some(peer)) = (self.classes.get(&key), packet.src_ip()) {
            if let Some(state) = class.find_state(peer) {
                state.on_receive(packet.is_reflected(), cpu, now, &params);
            }
        }

        if let Some(vq) = vq {
            if params.auto_generate_feedback && vq.is_enabled() {
                let congested = vq.is_congested(&params);
                if congested || params.always_feedback {
                    vq.generate_feedback(congested, packet, now, &self.dp);
                }
            }
        }

        Verdict::Pass
    }

    fn on_feedback(&self, packet: &Packet, cpu: usize, now: u64, params: &Params) {
        let Some(fb) = Feedback::decode(packet, params.feedback_ipproto) else {
            return;
        };
        let Some(class) = K::classify_rx(packet).and_then(|key| self.classes.get(&key)) else {
            return;
        };

        if let Some(state) = class.find_state(fb.src_ip) {
            let changed = state.on_receive(fb.is_marked(), cpu, now, params);
            trace!(peer = %fb.src_ip, marked = fb.is_marked(), changed, rfair = state.rc().rfair(), "feedback");
        }
    }

    /// Creates a class and fills its destination pool.
    pub fn install_class(&self, key: K) -> Result<Arc<TxClass<K>>> {
        let _span = debug_span!("install_class", %key).entered();
        if self.dp.is_shutdown() {
            return Err(Error::Shutdown);
        }

        let params = self.dp.params();
        let now = self.dp.now();
        let class = Arc::new(TxClass::new(key, now, self.dp.num_cpus(), &params, self.refill_tx.clone()));
        class.refill_pool(now, &params);

        self.classes
            .insert(key, Arc::clone(&class))
            .map_err(|_| Error::ClassExists(key.to_string()))?;

        debug!("class installed");
        Ok(class)
    }

    /// Creates a static virtual queue: one that idle detection never deactivates.
    pub fn install_queue(&self, key: K) -> Result<Arc<VirtualQueue>> {
        let _span = debug_span!("install_queue", %key).entered();
        if self.dp.is_shutdown() {
            return Err(Error::Shutdown);
        }

        let vq = Arc::new(VirtualQueue::new(self.dp.now(), self.dp.num_cpus(), &self.dp.params()));
        vq.set_static(true);

        self.vqs
            .index()
            .insert(key, Arc::clone(&vq))
            .map_err(|_| Error::QueueExists(key.to_string()))?;

        debug!("queue installed");
        Ok(vq)
    }

    /// Associates a class with a virtual queue, replacing any previous association.
    pub fn associate(&self, class: K, queue: K) -> Result<()> {
        let _span = debug_span!("associate", %class, %queue).entered();
        let txc = self.classes.get(&class).ok_or_else(|| Error::UnknownClass(class.to_string()))?;
        let vq = self.vqs.get(&queue).ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;

        if let Some(previous) = txc.set_vq(queue, vq) {
            debug!(previous = %previous.key, "association replaced");
        }
        Ok(())
    }

    pub fn set_queue_weight(&self, queue: K, weight: u64) -> Result<()> {
        let _span = debug_span!("set_queue_weight", %queue, weight).entered();
        if weight == 0 {
            return Err(Error::ZeroWeight);
        }

        let vq = self.vqs.get(&queue).ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
        vq.set_weight(weight, self.vqs.shared());
        self.vqs.calculate_rates(&self.dp.params());
        Ok(())
    }

    /// Enables or disables a virtual queue. A disabled queue stops accounting received traffic,
    /// sends no feedback, and gives up its share of the drain rate.
    pub fn set_queue_enabled(&self, queue: K, enabled: bool) -> Result<()> {
        let _span = debug_span!("set_queue_enabled", %queue, enabled).entered();
        let vq = self.vqs.get(&queue).ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
        vq.set_enabled(enabled, self.vqs.shared());
        self.vqs.calculate_rates(&self.dp.params());
        Ok(())
    }

    /// Removes a class, dropping its queued packets and releasing its virtual queue.
    pub fn remove_class(&self, key: K) -> Result<()> {
        let _span = debug_span!("remove_class", %key).entered();
        let class = self.classes.remove(&key).ok_or_else(|| Error::UnknownClass(key.to_string()))?;

        class.clear_vq();
        let dropped = class.flush();
        let dests = class.clear();
        key.release();

        debug!(dropped, dests, "class removed");
        Ok(())
    }

    /// Removes a virtual queue. Refused while a class is still associated with it.
    pub fn remove_queue(&self, key: K) -> Result<()> {
        let _span = debug_span!("remove_queue", %key).entered();
        let vq = self.vqs.get(&key).ok_or_else(|| Error::UnknownQueue(key.to_string()))?;
        let refcount = vq.refcount();
        if refcount > 0 {
            return Err(Error::QueueInUse(key.to_string(), refcount));
        }

        self.vqs.remove(&key);
        self.vqs.calculate_rates(&self.dp.params());
        key.release();

        debug!("queue removed");
        Ok(())
    }

    /// Updates one tunable by name. Packet-path readers pick up the new value on their next
    /// operation.
    pub fn set_param(&self, name: &str, value: &str) -> Result<()> {
        let _span = debug_span!("set_param", param = name, value).entered();
        let mut params = Params::clone(&self.dp.params());
        params.set(name, value)?;

        // The shards are sized once.
        if params.num_cpus != self.dp.num_cpus() {
            return Err(Error::InvalidParam { name: name.to_owned(), value: value.to_owned() });
        }

        self.vqs.calculate_rates(&params);
        self.dp.store_params(params);
        debug!("parameter updated");
        Ok(())
    }

    /// Applies an administration command.
    pub fn execute(&self, command: Command<K>) -> Result<()> {
        match command {
            Command::CreateClass(key) => self.install_class(key).map(drop),
            Command::CreateQueue(key) => self.install_queue(key).map(drop),
            Command::Associate { class, queue } => self.associate(class, queue),
            Command::SetQueueWeight { queue, weight } => self.set_queue_weight(queue, weight),
            Command::SetQueueEnabled { queue, enabled } => self.set_queue_enabled(queue, enabled),
            Command::SetParam { name, value } => self.set_param(&name, &value),
            Command::DeleteClass(key) => self.remove_class(key),
            Command::DeleteQueue(key) => self.remove_queue(key),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let mut classes: Vec<_> = self.classes.values().iter().map(|class| class.stats()).collect();
        classes.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        let mut queues: Vec<_> = self
            .vqs
            .index()
            .snapshot()
            .iter()
            .map(|(key, vq)| vq.stats(key.to_string()))
            .collect();
        queues.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        let dp = self.dp.stats();
        EngineStats {
            classes,
            queues,
            active_weight: self.vqs.shared().active_weight(),
            tx_packets: dp.tx_packets(),
            tx_bytes: dp.tx_bytes(),
            tx_busy: dp.tx_busy(),
            tx_oversized: dp.tx_oversized(),
            deferred_runs: dp.deferred_runs(),
        }
    }
}

impl<K: ClassKey> Drop for Engine<K> {
    fn drop(&mut self) {
        self.dp.begin_shutdown();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.dp.clear_active();
    }
}
