//! The router: rule dispatch, route-group lifecycle, dial and accept.
//!
//! The router consumes the transport manager's inbox and acts on each
//! packet according to the rule its route id matches: intermediary rules
//! forward onto the named transport with the route id rewritten; consume
//! rules deliver to the route group keyed by the rule's descriptor.

use crate::error::{Result, RouterError};
use crate::route_group::{GroupMap, RouteGroup, RouteGroupConfig};
use crate::routefinder::{RouteFinder, RouteOptions};
use crate::setup::rpc::RpcGateway;
use crate::setup::RouteGroupDialer;
use skein_crypto::PublicKey;
use skein_routing::{
    BidirectionalRoute, CloseCode, EdgeRules, Packet, PacketType, Path, PathEdges,
    RouteDescriptor, RouteId, RoutingTable, Rule, RuleType,
};
use skein_transport::network::Network;
use skein_transport::{TransportManager, AWAIT_SETUP_PORT};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default expiration interval installed on dialed routes.
pub const DEFAULT_ROUTE_KEEP_ALIVE: Duration = Duration::from_secs(120);

/// Capacity of the accept channel feeding [`Router::accept_routes`].
const ACCEPT_CAPACITY: usize = 1024;

/// Hard budget for route-finder retries in one dial.
const ROUTE_FINDER_BUDGET: Duration = Duration::from_secs(10);

/// Route-finder retry backoff bounds.
const ROUTE_FINDER_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const ROUTE_FINDER_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Cadence of the rule-expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Router configuration.
pub struct RouterConfig {
    /// Setup nodes trusted to install rules
    pub setup_nodes: Vec<PublicKey>,
    /// Candidate-path source
    pub route_finder: Arc<dyn RouteFinder>,
    /// Rule-installation negotiator
    pub setup_dialer: Arc<dyn RouteGroupDialer>,
    /// Keep-alive installed on dialed routes
    pub keep_alive: Duration,
}

/// Creates and keeps track of routes between this visor and others.
pub struct Router {
    conf: RouterConfig,
    network: Arc<Network>,
    tm: Arc<TransportManager>,
    rt: Arc<RoutingTable>,
    trusted: HashSet<PublicKey>,

    groups: GroupMap,
    accept_tx: Mutex<Option<mpsc::Sender<EdgeRules>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<EdgeRules>>,

    served: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    /// Construct a router over an existing transport manager and table.
    #[must_use]
    pub fn new(
        network: Arc<Network>,
        tm: Arc<TransportManager>,
        rt: Arc<RoutingTable>,
        conf: RouterConfig,
    ) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CAPACITY);
        let trusted = conf.setup_nodes.iter().copied().collect();
        Arc::new(Self {
            conf,
            network,
            tm,
            rt,
            trusted,
            groups: Arc::new(Mutex::new(HashMap::new())),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            served: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Local visor key.
    #[must_use]
    pub fn local_pk(&self) -> PublicKey {
        self.tm.local_pk()
    }

    /// The routing table this router dispatches against.
    #[must_use]
    pub fn routing_table(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.rt)
    }

    /// Whether `pk` may install rules over the setup gateway.
    #[must_use]
    pub fn setup_is_trusted(&self, pk: PublicKey) -> bool {
        self.trusted.contains(&pk)
    }

    /// Run the packet loop, the setup gateway and the expiry sweep, and
    /// start the transport manager. Idempotent.
    pub async fn serve(self: &Arc<Self>) {
        if self.served.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("starting router");

        let router = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            router.serve_transport_manager().await;
        }));

        for net_type in self.network.network_types() {
            let mut listener = match self.network.listen(net_type, AWAIT_SETUP_PORT).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::warn!(%net_type, %err, "failed to bind setup gateway");
                    continue;
                }
            };
            let router = Arc::clone(self);
            self.push_task(tokio::spawn(async move {
                let gateway = RpcGateway::new(Arc::clone(&router));
                while let Ok(conn) = listener.accept().await {
                    eprintln!("DEBUG accepted conn");
                    let peer = conn.remote_pk();
                    if !router.setup_is_trusted(peer) {
                        eprintln!("DEBUG untrusted, dropping");
                        tracing::warn!(%peer, "dropping connection from untrusted setup node");
                        continue;
                    }
                    eprintln!("DEBUG trusted, serving");
                    tracing::info!(%peer, "handling setup request");
                    gateway.serve_conn(conn).await;
                }
                eprintln!("DEBUG accept loop exited");
            }));
        }

        let router = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                router.sweep_expired().await;
            }
        }));

        self.tm.serve().await;
    }

    /// Establish a bidirectional route to `remote` and return its group.
    ///
    /// Finds candidate paths, has a setup node install forward and reverse
    /// rules along them, records the edge rules locally and merges them
    /// into the group map.
    ///
    /// # Errors
    ///
    /// `NoRoute` after the finder budget is spent, `SetupRejected` if no
    /// setup node installs the route, `NotServing` after close.
    pub async fn dial_routes(
        &self,
        remote: PublicKey,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Arc<RouteGroup>> {
        if self.is_closed() {
            return Err(RouterError::NotServing);
        }

        let local = self.local_pk();
        let desc = RouteDescriptor::new(local, remote, local_port, remote_port);

        let (forward, reverse) = self.fetch_best_routes(local, remote).await?;
        let route = BidirectionalRoute {
            desc,
            keep_alive_ms: self.conf.keep_alive.as_millis() as u64,
            forward,
            reverse,
        };

        let rules = self
            .conf
            .setup_dialer
            .dial_route_group(&self.conf.setup_nodes, route)
            .await?;

        self.save_routing_rules(&[rules.forward.clone(), rules.reverse.clone()]);
        let group = self.save_route_group_rules(rules)?;

        tracing::info!(%remote, local_port, "created new routes");
        Ok(group)
    }

    /// Block until a remote visor initiates a circuit toward us, then
    /// install its rules and return the group.
    ///
    /// # Errors
    ///
    /// `NotServing` once the router closes.
    pub async fn accept_routes(&self) -> Result<Arc<RouteGroup>> {
        let rules = {
            let mut rx = self.accept_rx.lock().await;
            rx.recv().await.ok_or(RouterError::NotServing)?
        };
        self.save_routing_rules(&[rules.forward.clone(), rules.reverse.clone()]);
        self.save_route_group_rules(rules)
    }

    /// Called by the setup gateway when a peer installs endpoint rules for
    /// us; feeds [`accept_routes`](Self::accept_routes).
    ///
    /// # Errors
    ///
    /// `ClosedPipe` after close; `SetupRejected` if the accept queue is
    /// full.
    pub fn introduce_rules(&self, rules: EdgeRules) -> Result<()> {
        // the sender lives behind the same lock close() takes, so a send
        // cannot race the channel teardown
        let guard = self.lock_accept_tx();
        match guard.as_ref() {
            None => Err(RouterError::ClosedPipe),
            Some(tx) => tx.try_send(rules).map_err(|err| match err {
                mpsc::error::TrySendError::Closed(_) => RouterError::ClosedPipe,
                mpsc::error::TrySendError::Full(_) => {
                    RouterError::SetupRejected("accept queue full".into())
                }
            }),
        }
    }

    /// Save rules to the routing table.
    pub fn save_routing_rules(&self, rules: &[Rule]) {
        for rule in rules {
            tracing::debug!(%rule, "saving routing rule");
            self.rt.save_rule(rule.clone());
        }
    }

    /// Reserve `n` route ids.
    ///
    /// # Errors
    ///
    /// Table exhaustion.
    pub fn reserve_keys(&self, n: usize) -> Result<Vec<RouteId>> {
        Ok(self.rt.reserve_keys(n)?)
    }

    /// Fetch a rule, rejecting stored rules shorter than the header.
    ///
    /// # Errors
    ///
    /// `Routing(NotFound)` when absent or expired.
    pub fn rule(&self, id: RouteId) -> Result<Rule> {
        Ok(self.rt.rule(id)?)
    }

    /// Whether the router has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every route group, the accept channel, the setup gateway and
    /// the transport manager. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("closing router");

        // groups must not outlive the manager their transports live on
        let groups: Vec<Arc<RouteGroup>> = self
            .lock_groups()
            .values()
            .cloned()
            .collect();
        for group in groups {
            group.close().await;
        }

        *self.lock_accept_tx() = None;

        let tasks: Vec<_> = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        self.tm.close().await;
    }

    async fn serve_transport_manager(&self) {
        loop {
            let packet = match self.tm.read_packet().await {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::debug!(%err, "stopped serving transports");
                    return;
                }
            };
            if let Err(err) = self.handle_transport_packet(packet).await {
                tracing::warn!(%err, "failed to handle transport packet");
            }
        }
    }

    async fn handle_transport_packet(&self, packet: Packet) -> Result<()> {
        let route_id = packet.route_id();
        let rule = match self.rt.rule(route_id) {
            Ok(rule) => rule,
            Err(_) => {
                // no rule: drop the packet, keep the transport
                tracing::debug!(%route_id, ty = %packet.ty(), "dropping packet with unknown route id");
                return Ok(());
            }
        };
        self.rt.update_activity(route_id);

        match packet.ty() {
            PacketType::Data => self.handle_data_packet(packet, &rule).await,
            PacketType::Close => self.handle_close_packet(packet, &rule).await,
            PacketType::KeepAlive => self.handle_keep_alive_packet(packet, &rule).await,
        }
    }

    async fn handle_data_packet(&self, packet: Packet, rule: &Rule) -> Result<()> {
        if rule.rule_type() != RuleType::Consume {
            return self.forward_packet(packet, rule).await;
        }

        let desc = rule.route_descriptor()?;
        let group = self
            .route_group(&desc)
            .ok_or(RouterError::UnknownDescriptor(desc))?;
        if group.is_closed() {
            return Err(RouterError::ClosedPipe);
        }
        group.push_payload(packet.into_payload()).await
    }

    async fn handle_close_packet(&self, packet: Packet, rule: &Rule) -> Result<()> {
        let route_id = packet.route_id();
        tracing::debug!(%route_id, "received close packet");

        if rule.rule_type() == RuleType::IntermediaryForward {
            let result = self.forward_packet(packet, rule).await;
            self.rt.del_rules(&[route_id]);
            return result;
        }

        let code = packet.close_code().unwrap_or(CloseCode::NORMAL);
        let result = match rule.route_descriptor() {
            Ok(desc) => match self.route_group(&desc) {
                Some(group) if !group.is_closed() => {
                    group.handle_close_packet(code).await;
                    Ok(())
                }
                Some(_) => Err(RouterError::ClosedPipe),
                None => Err(RouterError::UnknownDescriptor(desc)),
            },
            Err(err) => Err(err.into()),
        };
        self.rt.del_rules(&[route_id]);
        result
    }

    async fn handle_keep_alive_packet(&self, packet: Packet, rule: &Rule) -> Result<()> {
        if rule.rule_type() == RuleType::IntermediaryForward {
            return self.forward_packet(packet, rule).await;
        }
        // endpoint rules: activity is already updated; refresh the pair
        if let Ok(desc) = rule.route_descriptor() {
            if let Some(group) = self.route_group(&desc) {
                group.handle_keep_alive();
            }
        }
        Ok(())
    }

    async fn forward_packet(&self, packet: Packet, rule: &Rule) -> Result<()> {
        let tp_id = rule.next_transport_id()?;
        let transport = self
            .tm
            .transport(tp_id)
            .ok_or(RouterError::UnknownTransport(tp_id))?;
        let next = rule.next_route_id()?;

        let out = match packet.ty() {
            PacketType::Data => Packet::data(next, packet.into_payload())?,
            PacketType::Close => {
                Packet::close(next, packet.close_code().unwrap_or(CloseCode::NORMAL))
            }
            PacketType::KeepAlive => Packet::keep_alive(next),
        };
        transport.write_packet(&out).await?;

        tracing::debug!(%tp_id, key = %rule.key_route_id(), %next, "forwarded packet");
        Ok(())
    }

    /// Merge freshly installed edge rules into the group map.
    fn save_route_group_rules(&self, rules: EdgeRules) -> Result<Arc<RouteGroup>> {
        let desc = rules.desc;
        tracing::debug!(%desc, "saving route group rules");

        let group = {
            let mut groups = self.lock_groups();
            match groups.get(&desc) {
                Some(group) if !group.is_closed() => Arc::clone(group),
                _ => {
                    let cfg = RouteGroupConfig {
                        keep_alive: rules.forward.keep_alive(),
                        ..RouteGroupConfig::default()
                    };
                    let group = RouteGroup::new(
                        cfg,
                        desc,
                        self.local_pk(),
                        Arc::clone(&self.rt),
                        Arc::clone(&self.groups),
                    );
                    groups.insert(desc, Arc::clone(&group));
                    group.spawn_keep_alive();
                    group
                }
            }
        };

        let transport = rules
            .forward
            .next_transport_id()
            .ok()
            .and_then(|id| self.tm.transport(id));
        group.add_path(rules.forward, rules.reverse, transport);
        Ok(group)
    }

    async fn fetch_best_routes(
        &self,
        src: PublicKey,
        dst: PublicKey,
    ) -> Result<(Path, Path)> {
        tracing::debug!(%src, %dst, "requesting routes");
        let forward = PathEdges(src, dst);
        let backward = PathEdges(dst, src);
        let edges = [forward, backward];

        let deadline = Instant::now() + ROUTE_FINDER_BUDGET;
        let mut backoff = ROUTE_FINDER_BACKOFF_INITIAL;
        loop {
            let err = match self
                .conf
                .route_finder
                .find_routes(&edges, RouteOptions::default())
                .await
            {
                Ok(mut paths) => {
                    let fwd = paths.get_mut(&forward).and_then(|p| {
                        if p.is_empty() { None } else { Some(p.remove(0)) }
                    });
                    let rev = paths.get_mut(&backward).and_then(|p| {
                        if p.is_empty() { None } else { Some(p.remove(0)) }
                    });
                    match (fwd, rev) {
                        (Some(fwd), Some(rev)) => return Ok((fwd, rev)),
                        _ => RouterError::NoRoute("no path in either direction".into()),
                    }
                }
                Err(err) => err,
            };

            if Instant::now() + backoff >= deadline {
                return Err(RouterError::NoRoute(err.to_string()));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(ROUTE_FINDER_BACKOFF_MAX);
        }
    }

    async fn sweep_expired(&self) {
        let removed = self.rt.sweep();
        for rule in removed {
            let Ok(desc) = rule.route_descriptor() else {
                continue;
            };
            if let Some(group) = self.route_group(&desc) {
                group.handle_expiry().await;
            }
        }
    }

    fn route_group(&self, desc: &RouteDescriptor) -> Option<Arc<RouteGroup>> {
        self.lock_groups().get(desc).cloned()
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, HashMap<RouteDescriptor, Arc<RouteGroup>>> {
        self.groups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_accept_tx(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<EdgeRules>>> {
        self.accept_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local_pk", &self.local_pk())
            .field("groups", &self.lock_groups().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
