//! Discovery Module Tests
//!
//! ## Test Scopes
//! - **Events & Topology**: Masks, in-order application, idempotent redelivery.
//! - **Listeners**: Subscription handles and panic isolation.
//! - **Journal**: Append fencing and garbage collection.
//! - **Cluster Scenarios**: Whole clusters over the in-memory ensemble and the local
//!   transport: joins, failures, failover, reconnects, resolution rounds and custom
//!   events.

#[cfg(test)]
mod tests {
    use crate::config::DiscoveryConfig;
    use crate::coordination::{
        self, CoordinationClient, CoordinationStore, CreateMode, MemoryEnsemble, StoreError, paths,
    };
    use crate::discovery::journal::{EventJournal, JournalEntry};
    use crate::discovery::listeners::ListenerRegistry;
    use crate::discovery::protocol::CustomMessage;
    use crate::discovery::topology::LocalTopology;
    use crate::discovery::types::{DiscoveryEvent, EventMask, EventType, TopologySnapshot};
    use crate::discovery::{DiscoveryNode, NodeSpec};
    use crate::error::DiscoveryError;
    use crate::membership::types::{ClusterNode, NodeId};
    use crate::resolver::ResolverKind;
    use crate::security::{AuthDecision, Authenticator, Credentials, JoinCandidate};
    use crate::transport::{LocalNetwork, MessageHandlerFn, Transport};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    // ============================================================
    // HARNESS
    // ============================================================

    type Recorded = Arc<Mutex<Vec<DiscoveryEvent>>>;

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            session_timeout: Duration::from_millis(600),
            ack_threshold: 1,
            ack_flush_interval: Duration::from_millis(50),
            resolution_timeout: Duration::from_secs(3),
            ping_timeout: Duration::from_millis(200),
            coordinator_tick: Duration::from_millis(20),
            ..DiscoveryConfig::default()
        }
    }

    struct TestCluster {
        ensemble: MemoryEnsemble,
        network: LocalNetwork,
        config: DiscoveryConfig,
    }

    impl TestCluster {
        fn new() -> Self {
            Self::with_config(fast_config())
        }

        fn with_config(config: DiscoveryConfig) -> Self {
            Self {
                ensemble: MemoryEnsemble::new(),
                network: LocalNetwork::new(),
                config,
            }
        }

        fn node(&self, spec: NodeSpec) -> Arc<DiscoveryNode> {
            let store: Arc<dyn CoordinationStore> = Arc::new(self.ensemble.clone());
            DiscoveryNode::new(spec, store, self.network.transport())
        }

        async fn server(&self) -> Arc<DiscoveryNode> {
            let node = self.node(NodeSpec::server(self.config.clone()));
            node.join().await.unwrap();
            node
        }

        async fn client(&self) -> Arc<DiscoveryNode> {
            let node = self.node(NodeSpec::client(self.config.clone()));
            node.join().await.unwrap();
            node
        }

        /// Joins a node with a listener attached before the join.
        async fn recorded(&self, spec: NodeSpec) -> (Arc<DiscoveryNode>, Recorded) {
            let node = self.node(spec);
            let recorded = record(&node);
            node.join().await.unwrap();
            (node, recorded)
        }
    }

    fn record(node: &DiscoveryNode) -> Recorded {
        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();
        node.local_listen(EventMask::ALL, move |event| sink.lock().push(event.clone()));
        recorded
    }

    fn count(recorded: &Recorded, event_type: EventType) -> usize {
        recorded
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }

    async fn eventually<F>(what: &str, check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !check() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_retained(node: &DiscoveryNode, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let retained = node.retained_journal_len().await.unwrap();
            if retained == expected {
                return;
            }
            if Instant::now() > deadline {
                panic!("journal kept {} entries, expected {}", retained, expected);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Local transport whose bind takes `delay`.
    struct SlowBind {
        inner: Arc<dyn Transport>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Transport for SlowBind {
        async fn bind(
            &self,
            node_id: &NodeId,
            handler: MessageHandlerFn,
        ) -> anyhow::Result<BTreeMap<String, String>> {
            tokio::time::sleep(self.delay).await;
            self.inner.bind(node_id, handler).await
        }

        async fn unbind(&self, node_id: &NodeId) {
            self.inner.unbind(node_id).await
        }

        async fn send(&self, from: &NodeId, to: &ClusterNode, payload: Vec<u8>) -> anyhow::Result<()> {
            self.inner.send(from, to, payload).await
        }

        async fn ping(&self, from: &NodeId, to: &ClusterNode, timeout: Duration) -> bool {
            self.inner.ping(from, to, timeout).await
        }
    }

    fn test_node(idx: u64) -> ClusterNode {
        ClusterNode {
            id: NodeId(format!("n{}", idx)),
            order: idx,
            internal_order: idx,
            consistent_id: format!("n{}", idx),
            attributes: BTreeMap::new(),
            client: false,
        }
    }

    fn entry(version: u64, event_type: EventType, node: ClusterNode, nodes: Vec<ClusterNode>) -> JournalEntry {
        JournalEntry {
            version,
            event_type,
            max_order: nodes.iter().map(|n| n.order).max().unwrap_or(0),
            node,
            nodes,
            custom: None,
            reason: None,
        }
    }

    struct RejectLogin(&'static str);

    impl Authenticator for RejectLogin {
        fn authenticate(&self, _candidate: &JoinCandidate<'_>, credentials: &Credentials) -> AuthDecision {
            if credentials.login.as_deref() == Some(self.0) {
                AuthDecision::Reject(format!("login {} is banned", self.0))
            } else {
                AuthDecision::Accept
            }
        }
    }

    // ============================================================
    // EVENT & TOPOLOGY TESTS
    // ============================================================

    #[test]
    fn test_event_mask_combinations() {
        let mask = EventType::NodeJoined | EventType::NodeFailed;

        assert!(mask.contains(EventType::NodeJoined));
        assert!(mask.contains(EventType::NodeFailed));
        assert!(!mask.contains(EventType::NodeLeft));
        assert!(EventMask::NONE.is_empty());
        let every = EventMask::of(&[
            EventType::NodeJoined,
            EventType::NodeLeft,
            EventType::NodeFailed,
            EventType::Custom,
            EventType::NodeSegmented,
            EventType::ClientDisconnected,
            EventType::ClientReconnected,
        ]);
        assert_eq!(every, EventMask::ALL);
        assert!(EventType::NodeFailed.changes_topology());
        assert!(!EventType::Custom.changes_topology());
        assert!((mask | EventType::Custom).contains(EventType::Custom));
    }

    #[test]
    fn test_topology_snapshot_views() {
        let mut client = test_node(3);
        client.client = true;
        let snapshot = TopologySnapshot::new(7, vec![test_node(2), client, test_node(1)]);

        assert_eq!(snapshot.coordinator().map(|n| n.order), Some(1));
        assert_eq!(snapshot.servers().len(), 2);
        assert_eq!(snapshot.clients().len(), 1);
        assert_eq!(snapshot.max_order(), 3);
        assert_eq!(snapshot.nodes[0].order, 1);
    }

    #[test]
    fn test_redelivered_entry_changes_nothing() {
        let topology = LocalTopology::new(16);
        let listeners = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        listeners.register(EventMask::ALL, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = entry(1, EventType::NodeJoined, test_node(1), vec![test_node(1)]);
        for event in topology.offer(first.clone()) {
            listeners.notify(&event);
        }
        let before = topology.snapshot();

        for event in topology.offer(first) {
            listeners.notify(&event);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&before, &topology.snapshot()));
        assert_eq!(topology.history().len(), 1);
    }

    #[test]
    fn test_out_of_order_entries_are_buffered() {
        let topology = LocalTopology::new(16);
        let v1 = entry(1, EventType::NodeJoined, test_node(1), vec![test_node(1)]);
        let v2 = entry(2, EventType::NodeJoined, test_node(2), vec![test_node(1), test_node(2)]);
        let v3 = entry(3, EventType::NodeFailed, test_node(1), vec![test_node(2)]);

        assert!(topology.offer(v3).is_empty());
        assert!(topology.offer(v1.clone()).len() == 1);
        assert_eq!(topology.first_pending(), Some(3));

        let applied = topology.offer(v2);
        let versions: Vec<u64> = applied.iter().map(|e| e.version).collect();

        assert_eq!(versions, vec![2, 3]);
        assert_eq!(topology.version(), 3);
        assert_eq!(topology.snapshot().ids(), vec![NodeId::from("n2")]);
        assert!(topology.offer(v1).is_empty());
    }

    #[test]
    fn test_reset_and_local_events() {
        let topology = LocalTopology::new(2);
        topology.reset(TopologySnapshot::new(10, vec![test_node(1)]));

        topology.local_event(EventType::ClientDisconnected, test_node(1));
        topology.local_event(EventType::ClientReconnected, test_node(1));
        let last = topology.local_event(EventType::NodeSegmented, test_node(1));

        assert_eq!(last.version, 10);
        assert!(last.event_type.is_local());
        // Bounded history
        let history = topology.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, EventType::ClientReconnected);
    }

    // ============================================================
    // LISTENER TESTS
    // ============================================================

    #[test]
    fn test_listener_mask_and_unregister() {
        let listeners = ListenerRegistry::new();
        let joined = Arc::new(AtomicUsize::new(0));
        let counter = joined.clone();
        let id = listeners.register(EventType::NodeJoined.into(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let join = entry(1, EventType::NodeJoined, test_node(1), vec![test_node(1)]).to_event();
        let fail = entry(2, EventType::NodeFailed, test_node(1), vec![]).to_event();
        listeners.notify(&join);
        listeners.notify(&fail);

        assert_eq!(joined.load(Ordering::SeqCst), 1);
        assert!(listeners.unregister(id));
        assert!(!listeners.unregister(id));

        listeners.notify(&join);
        assert_eq!(joined.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.listener_count(), 0);
    }

    #[test]
    fn test_listener_panic_is_isolated() {
        let listeners = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        listeners.register(EventMask::ALL, |_| panic!("listener bug"));
        let counter = calls.clone();
        listeners.register(EventMask::ALL, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let event = entry(1, EventType::NodeJoined, test_node(1), vec![test_node(1)]).to_event();
        let delivered = listeners.notify(&event);

        assert_eq!(delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ============================================================
    // JOURNAL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_journal_append_is_fenced() {
        let ensemble: Arc<dyn CoordinationStore> = Arc::new(MemoryEnsemble::new());
        let client = CoordinationClient::connect(ensemble, "/journal", Duration::from_secs(5), None)
            .await
            .unwrap();
        client.ensure_path("events").await.unwrap();
        let journal = EventJournal::new(client);

        let first = entry(1, EventType::NodeJoined, test_node(1), vec![test_node(1)]);
        journal.append(&first).await.unwrap();
        let err = journal.append(&first).await.unwrap_err();

        assert!(matches!(err, StoreError::NodeExists(_)));
        assert_eq!(journal.read(1).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_journal_gc_keeps_newest_entry() {
        let ensemble: Arc<dyn CoordinationStore> = Arc::new(MemoryEnsemble::new());
        let client = CoordinationClient::connect(ensemble, "/journal", Duration::from_secs(5), None)
            .await
            .unwrap();
        client.ensure_path("events").await.unwrap();
        let journal = EventJournal::new(client);
        for version in 1..=4 {
            let e = entry(version, EventType::Custom, test_node(1), vec![test_node(1)]);
            journal.append(&e).await.unwrap();
        }

        assert_eq!(journal.collect_garbage(2).await.unwrap(), 2);
        assert_eq!(journal.oldest_version().await.unwrap(), Some(3));

        assert_eq!(journal.collect_garbage(10).await.unwrap(), 1);
        assert_eq!(journal.retained_count().await.unwrap(), 1);
        assert_eq!(journal.tail().await.unwrap().map(|e| e.version), Some(4));
        assert_eq!(
            journal.read_from(3).await.unwrap().iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![4]
        );
    }

    // ============================================================
    // JOIN TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_server_coordinates_itself() {
        let cluster = TestCluster::new();

        let node = cluster.server().await;

        let local = node.local_node().unwrap();
        assert_eq!(local.order, 1);
        assert_eq!(node.topology().len(), 1);
        assert_eq!(node.topology_version(), 1);
        eventually("coordinator", || node.is_coordinator()).await;

        node.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_consistent_id_defaults_to_node_id() {
        let cluster = TestCluster::new();
        let server = cluster.server().await;
        let named = cluster.node(
            NodeSpec::server(cluster.config.clone())
                .with_consistent_id("stable-name")
                .with_attribute("zone", "a"),
        );
        named.join().await.unwrap();

        let topology = named.topology();
        let own = topology.node(&named.id()).unwrap();
        let first = topology.node(&server.id()).unwrap();
        assert_eq!(own.consistent_id, "stable-name");
        assert_eq!(own.attributes.get("zone").map(String::as_str), Some("a"));
        assert_eq!(first.consistent_id, server.id().to_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_node_id_is_rejected() {
        let cluster = TestCluster::new();
        let (first, recorded) = cluster
            .recorded(NodeSpec::server(cluster.config.clone()).with_node_id(NodeId::from("dup")))
            .await;
        let version = first.topology_version();

        // Another process: same coordination service, its own network endpoint
        let store: Arc<dyn CoordinationStore> = Arc::new(cluster.ensemble.clone());
        let second = DiscoveryNode::new(
            NodeSpec::server(cluster.config.clone()).with_node_id(NodeId::from("dup")),
            store,
            LocalNetwork::new().transport(),
        );
        let err = second.join().await.unwrap_err();

        assert!(matches!(err, DiscoveryError::DuplicateNodeId(ref id) if id.as_str() == "dup"));
        assert!(cluster.network.is_bound(&NodeId::from("dup")));

        // Same process: the endpoint of the id is already taken
        let twin = cluster.node(NodeSpec::server(cluster.config.clone()).with_node_id(NodeId::from("dup")));
        let err = twin.join().await.unwrap_err();

        assert!(matches!(err, DiscoveryError::DuplicateNodeId(ref id) if id.as_str() == "dup"));
        assert!(cluster.network.is_bound(&NodeId::from("dup")));
        assert_eq!(cluster.ensemble.list("/discovery/alive").len(), 1);
        assert!(cluster.ensemble.list("/discovery/joined").is_empty());
        assert_eq!(first.topology_version(), version);
        assert!(recorded.lock().is_empty());

        // No order was consumed
        let third = cluster.server().await;
        assert_eq!(third.local_node().unwrap().order, 2);
        assert_eq!(third.topology_version(), version + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_authentication_failure_is_returned_to_joiner() {
        let cluster = TestCluster::new();
        let coordinator = cluster.node(
            NodeSpec::server(cluster.config.clone()).with_authenticator(RejectLogin("mallory")),
        );
        coordinator.join().await.unwrap();
        let recorded = record(&coordinator);

        let intruder = cluster.node(
            NodeSpec::client(cluster.config.clone())
                .with_credentials(Credentials::new("mallory", "secret")),
        );
        let err = intruder.join().await.unwrap_err();

        assert!(matches!(err, DiscoveryError::AuthenticationFailed(ref reason) if reason.contains("mallory")));
        assert!(err.to_string().starts_with("Authentication failed for local node"));
        assert!(recorded.lock().is_empty());
        assert_eq!(coordinator.topology().len(), 1);

        let friend = cluster.node(
            NodeSpec::client(cluster.config.clone()).with_credentials(Credentials::new("alice", "pw")),
        );
        friend.join().await.unwrap();
        assert_eq!(friend.local_node().unwrap().order, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_calls_share_the_outcome() {
        let cluster = TestCluster::new();
        let coordinator = cluster.node(
            NodeSpec::server(cluster.config.clone()).with_authenticator(RejectLogin("mallory")),
        );
        coordinator.join().await.unwrap();

        let node = cluster.node(NodeSpec::client(cluster.config.clone()));
        let (a, b) = tokio::join!(
            async { node.join().await.map(|()| node.local_node().is_some()) },
            async { node.join().await.map(|()| node.local_node().is_some()) },
        );
        assert!(a.unwrap());
        assert!(b.unwrap());
        assert_eq!(coordinator.topology().len(), 2);

        let intruder = cluster.node(
            NodeSpec::client(cluster.config.clone())
                .with_credentials(Credentials::new("mallory", "secret")),
        );
        let (a, b) = tokio::join!(intruder.join(), intruder.join());
        assert!(matches!(a, Err(DiscoveryError::AuthenticationFailed(_))));
        assert!(matches!(b, Err(DiscoveryError::AuthenticationFailed(_))));
        assert!(intruder.local_node().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_times_out_without_server() {
        let config = DiscoveryConfig {
            join_timeout: Duration::from_millis(300),
            ..fast_config()
        };
        let cluster = TestCluster::with_config(config);
        let client = cluster.node(NodeSpec::client(cluster.config.clone()));

        let started = Instant::now();
        let err = client.join().await.unwrap_err();

        assert!(matches!(err, DiscoveryError::JoinTimeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(err.to_string().contains("Failed to connect to cluster"));
        // The abandoned request and marker are gone
        assert!(cluster.ensemble.list("/discovery/alive").is_empty());
        assert!(cluster.ensemble.list("/discovery/joined").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_invalid_node_id_is_refused() {
        let cluster = TestCluster::new();
        let node = cluster.node(NodeSpec::server(cluster.config.clone()).with_node_id(NodeId::from("a/b")));

        assert!(matches!(node.join().await, Err(DiscoveryError::InvalidNodeId(_))));
    }

    // ============================================================
    // EVENT CONSISTENCY TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_events_are_consistent_across_nodes() {
        let cluster = TestCluster::new();
        let mut nodes = Vec::new();
        for _ in 0..3 {
            nodes.push(cluster.recorded(NodeSpec::server(cluster.config.clone())).await);
        }
        nodes.push(cluster.recorded(NodeSpec::client(cluster.config.clone())).await);

        let late = cluster.server().await;
        nodes[1].0.stop().await.unwrap();
        late.send_custom(b"hello".to_vec()).await.unwrap();
        late.stop().await.unwrap();

        let survivors = [&nodes[0], &nodes[2], &nodes[3]];
        eventually("all survivors converge", || {
            survivors.iter().all(|(node, _)| node.topology().len() == 3)
                && survivors
                    .iter()
                    .all(|(_, recorded)| count(recorded, EventType::Custom) == 1)
                && survivors
                    .iter()
                    .all(|(node, _)| node.topology_version() == survivors[0].0.topology_version())
        })
        .await;

        let mut by_version: BTreeMap<u64, (EventType, NodeId)> = BTreeMap::new();
        for (_, recorded) in survivors {
            let events = recorded.lock().clone();
            let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
            for pair in versions.windows(2) {
                assert_eq!(pair[1], pair[0] + 1, "versions must be gap free: {:?}", versions);
            }
            for event in events {
                let seen = (event.event_type, event.node.id.clone());
                let expected = by_version.entry(event.version).or_insert_with(|| seen.clone());
                assert_eq!(*expected, seen, "version {} differs between nodes", event.version);
            }
        }
        assert!(by_version.values().any(|(t, _)| *t == EventType::NodeLeft));
        assert!(by_version.values().any(|(t, _)| *t == EventType::Custom));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_is_observed_as_left() {
        let cluster = TestCluster::new();
        let (first, recorded) = cluster.recorded(NodeSpec::server(cluster.config.clone())).await;
        let second = cluster.server().await;
        let second_id = second.id();

        second.stop().await.unwrap();
        second.stop().await.unwrap();

        eventually("left event", || count(&recorded, EventType::NodeLeft) == 1).await;
        let events = recorded.lock().clone();
        let left = events.iter().find(|e| e.event_type == EventType::NodeLeft).unwrap();
        assert_eq!(left.node.id, second_id);
        assert!(!left.snapshot.contains(&second_id));
        assert_eq!(count(&recorded, EventType::NodeFailed), 0);
        assert!(first.topology().len() == 1);
    }

    // ============================================================
    // LIVENESS TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pings() {
        let cluster = TestCluster::new();
        let first = cluster.server().await;
        let second = cluster.server().await;
        let target = second.id();
        eventually("second visible", || first.topology().contains(&target)).await;

        let pings = (0..32).map(|_| first.ping_node(&target));
        let results = futures::future::join_all(pings).await;
        assert!(results.iter().all(|alive| *alive));
        assert!(first.ping_node(&first.id()).await);

        second.stop().await.unwrap();

        let pings = (0..32).map(|_| first.ping_node(&target));
        let results = futures::future::join_all(pings).await;
        assert!(results.iter().all(|alive| !*alive));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_session_expiry_segments() {
        let cluster = TestCluster::new();
        let (first, first_events) = cluster.recorded(NodeSpec::server(cluster.config.clone())).await;
        let (second, second_events) = cluster.recorded(NodeSpec::server(cluster.config.clone())).await;
        let second_id = second.id();

        cluster.ensemble.expire_session(second.session_id().unwrap());

        eventually("segmentation", || count(&second_events, EventType::NodeSegmented) == 1).await;
        eventually("failure seen", || count(&first_events, EventType::NodeFailed) == 1).await;
        assert!(second.is_stopped());
        assert_eq!(
            second.state(),
            crate::reconnect::ClientConnectionState::Segmented
        );
        assert!(!first.topology().contains(&second_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coordinator_failover_keeps_versions_gap_free() {
        let cluster = TestCluster::new();
        let first = cluster.server().await;
        let (second, recorded) = cluster.recorded(NodeSpec::server(cluster.config.clone())).await;
        let third = cluster.server().await;
        eventually("first coordinates", || first.is_coordinator()).await;

        first.stop().await.unwrap();
        eventually("second takes over", || second.is_coordinator()).await;
        let fourth = cluster.server().await;

        assert_eq!(fourth.local_node().unwrap().order, 4);
        eventually("topology converges", || {
            second.topology().len() == 3 && third.topology().len() == 3
        })
        .await;

        let versions: Vec<u64> = recorded.lock().iter().map(|e| e.version).collect();
        for pair in versions.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        assert_eq!(count(&recorded, EventType::NodeLeft), 1);
        assert!(!third.is_coordinator());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coordinator_follows_order_when_joins_interleave() {
        let cluster = TestCluster::new();
        let first = cluster.server().await;

        // Registers its marker first but submits its request last
        let store: Arc<dyn CoordinationStore> = Arc::new(cluster.ensemble.clone());
        let slow = DiscoveryNode::new(
            NodeSpec::server(cluster.config.clone()),
            store,
            Arc::new(SlowBind {
                inner: cluster.network.transport(),
                delay: Duration::from_millis(800),
            }),
        );
        let slow_join = {
            let slow = slow.clone();
            tokio::spawn(async move { slow.join().await })
        };
        eventually("slow marker", || cluster.ensemble.list("/discovery/alive").len() == 2).await;
        let fast = cluster.server().await;
        slow_join.await.unwrap().unwrap();

        let slow_order = slow.local_node().unwrap().order;
        assert_eq!(fast.local_node().unwrap().order, 2);
        assert_eq!(slow_order, 3);

        first.stop().await.unwrap();
        eventually("fast takes over", || fast.is_coordinator()).await;
        eventually("two servers left", || {
            fast.topology().len() == 2 && slow.topology().len() == 2
        })
        .await;

        assert!(!slow.is_coordinator());
        for node in [&fast, &slow] {
            assert_eq!(node.topology().coordinator().map(|n| n.id.clone()), Some(fast.id()));
        }
        let late = cluster.server().await;
        assert_eq!(late.local_node().unwrap().order, slow_order + 1);
        assert!(fast.is_coordinator());
        assert!(!slow.is_coordinator());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fail_node_client_reconnects_server_segments() {
        let cluster = TestCluster::new();
        let first = cluster.server().await;
        let (second, second_events) = cluster.recorded(NodeSpec::server(cluster.config.clone())).await;
        let (client, client_events) = cluster.recorded(NodeSpec::client(cluster.config.clone())).await;
        let old_client = client.id();

        first.fail_node(&old_client, "operator request").await.unwrap();
        eventually("client back", || count(&client_events, EventType::ClientReconnected) == 1).await;
        assert_ne!(client.id(), old_client);
        eventually("new client visible", || first.topology().contains(&client.id())).await;

        first.fail_node(&second.id(), "operator request").await.unwrap();
        eventually("server segmented", || count(&second_events, EventType::NodeSegmented) == 1).await;
        assert!(second.is_stopped());

        let unknown = first.fail_node(&NodeId::from("ghost"), "nope").await.unwrap_err();
        assert!(matches!(unknown, DiscoveryError::UnknownNode(_)));
    }

    // ============================================================
    // CLIENT RECONNECT TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_client_reconnect_round_trip() {
        let cluster = TestCluster::new();
        let server = cluster.server().await;
        let (client, recorded) = cluster.recorded(NodeSpec::client(cluster.config.clone())).await;
        let old_id = client.id();
        let old_order = client.local_node().unwrap().order;
        let consistent_id = client.consistent_id();

        client.client_reconnect().await.unwrap();

        let local_events: Vec<EventType> = recorded
            .lock()
            .iter()
            .map(|e| e.event_type)
            .filter(|t| t.is_local())
            .collect();
        assert_eq!(
            local_events,
            vec![EventType::ClientDisconnected, EventType::ClientReconnected]
        );
        assert_eq!(client.state(), crate::reconnect::ClientConnectionState::Reconnected);

        let new_node = client.local_node().unwrap();
        assert_ne!(new_node.id, old_id);
        assert!(new_node.order > old_order);
        assert_eq!(new_node.consistent_id, consistent_id);

        eventually("server sees the new client only", || {
            let topology = server.topology();
            topology.contains(&new_node.id) && !topology.contains(&old_id)
        })
        .await;
        let orders: HashSet<u64> = server.topology().nodes.iter().map(|n| n.order).collect();
        assert_eq!(orders.len(), server.topology().len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reconnecting_client_replays_missed_events() {
        // Acks stay at the join versions, so nothing the client missed is collected
        let config = DiscoveryConfig {
            ack_threshold: 1000,
            ack_flush_interval: Duration::from_secs(60),
            ..fast_config()
        };
        let cluster = TestCluster::with_config(config);
        let _first = cluster.server().await;
        let (client, recorded) = cluster.recorded(NodeSpec::client(cluster.config.clone())).await;
        let old_id = client.id();

        cluster.ensemble.block_session(client.session_id().unwrap(), true);
        let second = cluster.server().await;
        let second_id = second.id();

        eventually("reconnect", || count(&recorded, EventType::ClientReconnected) == 1).await;
        eventually("old id failed", || {
            recorded
                .lock()
                .iter()
                .any(|e| e.event_type == EventType::NodeFailed && e.node.id == old_id)
        })
        .await;

        let events = recorded.lock().clone();
        let disconnected = events
            .iter()
            .position(|e| e.event_type == EventType::ClientDisconnected)
            .unwrap();
        let after: Vec<&DiscoveryEvent> = events[disconnected..]
            .iter()
            .filter(|e| e.event_type.changes_topology())
            .collect();
        let seen: Vec<(EventType, NodeId)> = after
            .iter()
            .map(|e| (e.event_type, e.node.id.clone()))
            .collect();
        assert_eq!(
            seen,
            vec![(EventType::NodeJoined, second_id.clone()), (EventType::NodeFailed, old_id.clone())]
        );
        assert!(after[0].version < after[1].version);
        assert!(
            !events
                .iter()
                .any(|e| e.event_type == EventType::NodeJoined && e.node.id == client.id())
        );

        let topology = client.topology();
        assert!(topology.contains(&second_id));
        assert!(topology.contains(&client.id()));
        assert!(!topology.contains(&old_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_during_reconnect_closes_the_new_session() {
        let cluster = TestCluster::new();
        let server = cluster.server().await;
        let (client, recorded) = cluster.recorded(NodeSpec::client(cluster.config.clone())).await;

        // No server is left, so the reconnect waits for an answer forever
        server.stop().await.unwrap();
        eventually("disconnect", || count(&recorded, EventType::ClientDisconnected) == 1).await;
        eventually("reconnect attempt", || client.session_id().is_some()).await;
        let attempt = client.session_id().unwrap();
        assert_eq!(cluster.ensemble.list("/discovery/alive").len(), 1);

        let started = Instant::now();
        client.stop().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!cluster.ensemble.is_session_alive(attempt));
        assert!(cluster.ensemble.list("/discovery/alive").is_empty());
        assert!(cluster.ensemble.list("/discovery/joined").is_empty());
        assert_eq!(count(&recorded, EventType::ClientReconnected), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_client_session_expiry_reconnects() {
        let cluster = TestCluster::new();
        let server = cluster.server().await;
        let (client, recorded) = cluster.recorded(NodeSpec::client(cluster.config.clone())).await;

        cluster.ensemble.expire_session(client.session_id().unwrap());

        eventually("disconnect", || count(&recorded, EventType::ClientDisconnected) == 1).await;
        eventually("reconnect", || count(&recorded, EventType::ClientReconnected) == 1).await;
        eventually("visible again", || server.topology().contains(&client.id())).await;
        assert!(client.state().is_connected());
        assert!(!client.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reconnect_disabled_segments_client() {
        let config = DiscoveryConfig {
            client_reconnect_disabled: true,
            ..fast_config()
        };
        let cluster = TestCluster::with_config(config);
        let _server = cluster.server().await;
        let (client, recorded) = cluster.recorded(NodeSpec::client(cluster.config.clone())).await;

        cluster.ensemble.expire_session(client.session_id().unwrap());

        eventually("segmented", || count(&recorded, EventType::NodeSegmented) == 1).await;
        assert_eq!(count(&recorded, EventType::ClientDisconnected), 0);
        assert_eq!(client.state(), crate::reconnect::ClientConnectionState::Segmented);
        assert!(client.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_servers_restart_with_many_clients() {
        let cluster = TestCluster::new();
        let mut servers = Vec::new();
        for _ in 0..5 {
            servers.push(cluster.server().await);
        }
        let mut clients = Vec::new();
        for _ in 0..10 {
            clients.push(cluster.recorded(NodeSpec::client(cluster.config.clone())).await);
        }
        eventually("15 nodes", || servers[0].topology().len() == 15).await;

        for server in &servers {
            server.stop().await.unwrap();
        }
        eventually("10 disconnects", || {
            clients
                .iter()
                .map(|(_, r)| count(r, EventType::ClientDisconnected))
                .sum::<usize>()
                == 10
        })
        .await;

        let mut restarted = Vec::new();
        for _ in 0..5 {
            restarted.push(cluster.server().await);
        }
        eventually("10 reconnects", || {
            clients
                .iter()
                .map(|(_, r)| count(r, EventType::ClientReconnected))
                .sum::<usize>()
                == 10
        })
        .await;
        eventually("final topology of 15", || restarted[0].topology().len() == 15).await;

        let topology = restarted[0].topology();
        let orders: HashSet<u64> = topology.nodes.iter().map(|n| n.order).collect();
        assert_eq!(orders.len(), 15);
        assert_eq!(topology.clients().len(), 10);
        for (client, _) in &clients {
            assert!(topology.contains(&client.id()));
        }
    }

    // ============================================================
    // CUSTOM EVENTS, MESSAGING & ACK GC TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_custom_events_are_delivered_and_collected() {
        let cluster = TestCluster::new();
        let (first, first_events) = cluster.recorded(NodeSpec::server(cluster.config.clone())).await;
        let (second, second_events) = cluster.recorded(NodeSpec::server(cluster.config.clone())).await;
        let (client, client_events) = cluster.recorded(NodeSpec::client(cluster.config.clone())).await;

        for idx in 0..5u8 {
            client.send_custom(vec![idx]).await.unwrap();
        }

        for recorded in [&first_events, &second_events, &client_events] {
            eventually("five custom events", || count(recorded, EventType::Custom) == 5).await;
        }
        let payloads = |recorded: &Recorded| -> Vec<(u64, Vec<u8>)> {
            recorded
                .lock()
                .iter()
                .filter(|e| e.event_type == EventType::Custom)
                .map(|e| (e.version, e.custom.clone().unwrap_or_default()))
                .collect()
        };
        assert_eq!(payloads(&first_events), payloads(&client_events));
        assert_eq!(payloads(&second_events), payloads(&client_events));
        assert_eq!(first.topology().len(), 3);

        // Every node acked everything, only the newest entry is retained
        wait_retained(&first, 1).await;
        assert_eq!(second.retained_journal_len().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batched_acks_hold_back_collection() {
        let flush = Duration::from_millis(1500);
        let config = DiscoveryConfig {
            ack_threshold: 4,
            ack_flush_interval: flush,
            ..fast_config()
        };
        let cluster = TestCluster::with_config(config);
        let first = cluster.server().await;
        let second = cluster.server().await;
        eventually("both at version 2", || first.topology_version() == 2).await;
        // Lets the ack of version 2 go out on the interval
        tokio::time::sleep(flush + Duration::from_millis(300)).await;
        wait_retained(&first, 1).await;

        // Below the threshold: held until the interval elapses
        let sent = Instant::now();
        for idx in 0..2u8 {
            second.send_custom(vec![idx]).await.unwrap();
        }
        eventually("version 4 applied", || {
            first.topology_version() == 4 && second.topology_version() == 4
        })
        .await;
        wait_retained(&first, 2).await;
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(first.retained_journal_len().await.unwrap(), 2);

        wait_retained(&first, 1).await;
        assert!(sent.elapsed() >= flush);

        // Reaching the threshold flushes right away
        let burst = Instant::now();
        for idx in 0..4u8 {
            second.send_custom(vec![idx]).await.unwrap();
        }
        eventually("version 8 applied", || {
            first.topology_version() == 8 && second.topology_version() == 8
        })
        .await;
        wait_retained(&first, 1).await;
        assert!(burst.elapsed() < flush);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_custom_message_from_departed_sender() {
        let cluster = TestCluster::new();
        let (_first, recorded) = cluster.recorded(NodeSpec::server(cluster.config.clone())).await;
        let second = cluster.server().await;
        let departed = second.local_node().unwrap();
        second.stop().await.unwrap();
        eventually("left", || count(&recorded, EventType::NodeLeft) == 1).await;

        let store: Arc<dyn CoordinationStore> = Arc::new(cluster.ensemble.clone());
        let writer = CoordinationClient::connect(store, "/discovery", Duration::from_secs(5), None)
            .await
            .unwrap();
        for sender in [NodeId::from("never-joined"), departed.id.clone()] {
            let message = CustomMessage {
                sender,
                payload: b"late".to_vec(),
            };
            writer
                .create_sequential(
                    paths::CUSTOM,
                    "",
                    coordination::encode(&message).unwrap(),
                    CreateMode::Persistent,
                )
                .await
                .unwrap();
        }

        eventually("queue drained", || cluster.ensemble.list("/discovery/custom").is_empty()).await;
        eventually("custom event", || count(&recorded, EventType::Custom) == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count(&recorded, EventType::Custom), 1);

        let events = recorded.lock().clone();
        let custom = events.iter().find(|e| e.event_type == EventType::Custom).unwrap();
        assert_eq!(custom.node, departed);
        assert_eq!(custom.custom.as_deref(), Some(&b"late"[..]));
        writer.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_direct_messages_and_broadcast() {
        let cluster = TestCluster::new();
        let first = cluster.server().await;
        let second = cluster.server().await;
        let third = cluster.client().await;
        eventually("all visible", || first.topology().len() == 3).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for node in [&second, &third] {
            let tx = tx.clone();
            let me = node.id();
            node.on_message(move |from: NodeId, payload: Vec<u8>| {
                let tx = tx.clone();
                let me = me.clone();
                async move {
                    tx.send((me, from, payload))?;
                    Ok::<_, anyhow::Error>(())
                }
            });
        }

        first.send(&second.id(), b"direct".to_vec()).await.unwrap();
        let (to, from, payload) = rx.recv().await.unwrap();
        assert_eq!((to, from, payload), (second.id(), first.id(), b"direct".to_vec()));

        let results = first.broadcast(b"all".to_vec()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        let mut receivers = HashSet::new();
        for _ in 0..2 {
            let (to, _, payload) = rx.recv().await.unwrap();
            assert_eq!(payload, b"all".to_vec());
            receivers.insert(to);
        }
        assert_eq!(receivers, HashSet::from([second.id(), third.id()]));

        let missing = first.send(&NodeId::from("ghost"), vec![]).await.unwrap_err();
        assert!(matches!(missing, DiscoveryError::UnknownNode(_)));
    }

    // ============================================================
    // COMMUNICATION PROBLEM RESOLUTION TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resolution_kills_isolated_server() {
        let cluster = TestCluster::new();
        let first = cluster.server().await;
        let second = cluster.server().await;
        let (third, third_events) = cluster.recorded(NodeSpec::server(cluster.config.clone())).await;
        let isolated = third.id();
        eventually("three servers", || second.topology().len() == 3).await;

        cluster.network.isolate(&isolated);
        let err = second.resolve_communication_error(&isolated).await.unwrap_err();

        assert!(err.is_topology_changed(), "unexpected error: {}", err);
        eventually("isolated server segmented", || {
            count(&third_events, EventType::NodeSegmented) == 1
        })
        .await;
        assert!(!first.topology().contains(&isolated));
        assert_eq!(first.topology().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resolution_with_healthy_network_kills_nothing() {
        let cluster = TestCluster::new();
        let first = cluster.server().await;
        let second = cluster.server().await;
        let client = cluster.client().await;
        eventually("three nodes", || first.topology().len() == 3).await;

        client.resolve_communication_error(&second.id()).await.unwrap();

        assert_eq!(first.topology().len(), 3);
        assert!(cluster.ensemble.list("/discovery/requests").is_empty());
        eventually("round cleaned up", || cluster.ensemble.list("/discovery/resolve").is_empty()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resolver_failure_reaches_initiator() {
        struct Broken;
        impl crate::resolver::CommunicationProblemResolver for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn resolve(&self, _ctx: &mut crate::resolver::CommunicationProblemContext) -> anyhow::Result<()> {
                anyhow::bail!("resolver exploded")
            }
        }

        let cluster = TestCluster::new();
        let first = cluster.node(
            NodeSpec::server(cluster.config.clone()).with_resolver(ResolverKind::Custom(Arc::new(Broken))),
        );
        first.join().await.unwrap();
        let second = cluster.server().await;
        eventually("two servers", || second.topology().len() == 2).await;

        let err = second.resolve_communication_error(&first.id()).await.unwrap_err();

        assert!(matches!(err.root_cause(), DiscoveryError::Resolver(msg) if msg.contains("exploded")));
        // The coordinator survived the failure
        assert!(first.is_coordinator());
        let third = cluster.server().await;
        assert_eq!(third.topology().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coordinator_killed_during_resolution() {
        let config = DiscoveryConfig {
            resolution_timeout: Duration::from_secs(30),
            ..fast_config()
        };
        let cluster = TestCluster::with_config(config);
        let first = cluster.server().await;
        let second = cluster.server().await;
        let third = cluster.server().await;
        let first_id = first.id();
        eventually("three servers", || third.topology().len() == 3).await;

        // Third's connectivity check hangs, so the round cannot complete
        cluster.network.pause_checks(&third.id());
        let resolution = {
            let second = second.clone();
            let target = third.id();
            tokio::spawn(async move { second.resolve_communication_error(&target).await })
        };
        eventually("round started", || !cluster.ensemble.list("/discovery/resolve").is_empty()).await;

        // Joins wait for the round
        let joiner = cluster.node(NodeSpec::server(cluster.config.clone()));
        let join = {
            let joiner = joiner.clone();
            tokio::spawn(async move { joiner.join().await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!join.is_finished());

        cluster.ensemble.expire_session(first.session_id().unwrap());
        eventually("second takes over", || second.is_coordinator()).await;
        cluster.network.resume_checks(&third.id());

        resolution.await.unwrap().unwrap();
        join.await.unwrap().unwrap();

        eventually("final topology", || second.topology().len() == 3).await;
        let topology = second.topology();
        assert!(!topology.contains(&first_id));
        assert!(topology.contains(&third.id()));
        assert!(topology.contains(&joiner.id()));
        eventually("old coordinator stopped", || first.is_stopped()).await;
    }
}
