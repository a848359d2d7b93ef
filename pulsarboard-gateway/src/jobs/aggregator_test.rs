#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use pulsarboard_core::stats::{MemoryStatsRepository, RepositoryError, Result as RepoResult};
    use pulsarboard_core::{
        metric, Aggregation, AggregationType, ManualClock, ResourceKey, ResourceKind, StatSnapshot, StatsRepository,
    };
    use rand::Rng;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::jobs::{Aggregator, AggregatorConfig, CycleOutcome, Job};
    use crate::read_through::{ReadError, TopologySource};
    use crate::upstream::UpstreamError;

    /// Topology answering from a fixed map, or failing when `None`. Topic
    /// listings fail for namespaces without an entry in `topics`.
    struct StaticTopology {
        layout: Option<BTreeMap<String, Vec<String>>>,
        topics: BTreeMap<(String, String), Vec<String>>,
    }

    impl StaticTopology {
        fn new(layout: Vec<(&str, Vec<&str>)>) -> Arc<Self> {
            Self::with_topics(layout, vec![])
        }

        fn with_topics(layout: Vec<(&str, Vec<&str>)>, topics: Vec<(&str, &str, Vec<&str>)>) -> Arc<Self> {
            Arc::new(StaticTopology {
                layout: Some(
                    layout
                        .into_iter()
                        .map(|(t, ns)| (t.to_string(), ns.into_iter().map(str::to_string).collect()))
                        .collect(),
                ),
                topics: topics
                    .into_iter()
                    .map(|(t, ns, names)| {
                        ((t.to_string(), ns.to_string()), names.into_iter().map(str::to_string).collect())
                    })
                    .collect(),
            })
        }

        fn unavailable() -> Arc<Self> {
            Arc::new(StaticTopology {
                layout: None,
                topics: BTreeMap::new(),
            })
        }

        fn layout(&self) -> Result<&BTreeMap<String, Vec<String>>, ReadError> {
            self.layout
                .as_ref()
                .ok_or_else(|| ReadError::NoFallbackAvailable(UpstreamError::Timeout))
        }
    }

    #[async_trait]
    impl TopologySource for StaticTopology {
        async fn tenants(&self) -> Result<Vec<String>, ReadError> {
            Ok(self.layout()?.keys().cloned().collect())
        }

        async fn namespaces(&self, tenant: &str) -> Result<Vec<String>, ReadError> {
            Ok(self.layout()?.get(tenant).cloned().unwrap_or_default())
        }

        async fn topics(&self, tenant: &str, namespace: &str) -> Result<Vec<String>, ReadError> {
            self.layout()?;
            self.topics
                .get(&(tenant.to_string(), namespace.to_string()))
                .cloned()
                .ok_or(ReadError::NoFallbackAvailable(UpstreamError::Timeout))
        }

        async fn brokers(&self) -> Result<Vec<String>, ReadError> {
            Ok(Vec::new())
        }
    }

    /// Repository whose aggregation upserts fail a set number of times. Tests
    /// using it have a single scope, so the attempt counter is per key.
    struct FlakyRepository {
        inner: MemoryStatsRepository,
        failures: HashMap<String, u32>,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StatsRepository for FlakyRepository {
        async fn insert_batch(&self, snapshots: &[StatSnapshot]) -> RepoResult<u64> {
            self.inner.insert_batch(snapshots).await
        }

        async fn latest(&self, kind: ResourceKind, key: &ResourceKey) -> RepoResult<Option<StatSnapshot>> {
            self.inner.latest(kind, key).await
        }

        async fn range(
            &self,
            kind: ResourceKind,
            key: &ResourceKey,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> RepoResult<Vec<StatSnapshot>> {
            self.inner.range(kind, key, from, to).await
        }

        async fn latest_as_of(&self, kind: ResourceKind, as_of: DateTime<Utc>) -> RepoResult<Vec<StatSnapshot>> {
            self.inner.latest_as_of(kind, as_of).await
        }

        async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> RepoResult<u64> {
            self.inner.purge_older_than(cutoff).await
        }

        async fn upsert_aggregation(&self, aggregation: &Aggregation) -> RepoResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let budget = self.failures.get(&aggregation.key).copied().unwrap_or(0);
            if attempt < budget {
                return Err(RepositoryError::Unavailable("connection reset".into()));
            }
            self.inner.upsert_aggregation(aggregation).await
        }

        async fn get_aggregation(&self, agg_type: AggregationType, key: &str) -> RepoResult<Option<Aggregation>> {
            self.inner.get_aggregation(agg_type, key).await
        }

        async fn list_aggregations(&self, agg_type: AggregationType) -> RepoResult<Vec<Aggregation>> {
            self.inner.list_aggregations(agg_type).await
        }

        async fn delete_aggregation(&self, agg_type: AggregationType, key: &str) -> RepoResult<bool> {
            self.inner.delete_aggregation(agg_type, key).await
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn topic_snapshot(tenant: &str, ns: &str, topic: &str, backlog: f64, at: DateTime<Utc>) -> StatSnapshot {
        let metrics = BTreeMap::from([
            (metric::BACKLOG.to_string(), backlog),
            (metric::MSG_RATE_IN.to_string(), 2.0),
            (metric::MSG_RATE_OUT.to_string(), 1.0),
            (metric::STORAGE_SIZE.to_string(), 1024.0),
        ]);
        StatSnapshot::new(ResourceKind::Topic, ResourceKey::topic(tenant, ns, topic), metrics, at)
    }

    fn aggregator(
        topology: Arc<dyn TopologySource>,
        repository: Arc<dyn StatsRepository>,
        now: DateTime<Utc>,
    ) -> Aggregator {
        Aggregator::new(
            topology,
            repository,
            Arc::new(ManualClock::new(now)),
            AggregatorConfig::default(),
        )
    }

    /// Test: tenant rollups sum the latest snapshot of each topic
    ///
    /// Purpose
    /// - Only the newest snapshot per topic counts, and tenants or namespaces
    ///   without topics get an all-zero rollup rather than none.
    ///
    /// Flow
    /// - acme/orders has two topics with two snapshots each; acme/billing and
    ///   tenant `empty` have no topics.
    ///
    /// Expected
    /// - acme backlog = 30 + 5 (latest values), topic_count 2; billing and
    ///   `empty` exist with zeros.
    #[tokio::test]
    async fn rollups_use_latest_snapshot_and_keep_empty_scopes() -> Result<(), Box<dyn std::error::Error>> {
        let repository = Arc::new(MemoryStatsRepository::new());
        repository
            .insert_batch(&[
                topic_snapshot("acme", "orders", "created", 10.0, t0() - ChronoDuration::seconds(60)),
                topic_snapshot("acme", "orders", "shipped", 1.0, t0() - ChronoDuration::seconds(60)),
            ])
            .await?;
        repository
            .insert_batch(&[
                topic_snapshot("acme", "orders", "created", 30.0, t0() - ChronoDuration::seconds(30)),
                topic_snapshot("acme", "orders", "shipped", 5.0, t0() - ChronoDuration::seconds(30)),
            ])
            .await?;

        let topology = StaticTopology::with_topics(
            vec![("acme", vec!["orders", "billing"]), ("empty", vec![])],
            vec![("acme", "orders", vec!["created", "shipped"]), ("acme", "billing", vec![])],
        );
        let report = aggregator(topology, repository.clone(), t0()).run_once().await;
        assert_eq!(report.outcome, CycleOutcome::Success);
        assert_eq!(report.persisted, 4);

        let acme = repository
            .get_aggregation(AggregationType::Tenant, "acme")
            .await?
            .ok_or("acme rollup")?;
        assert_eq!(acme.topic_count, 2);
        assert_eq!(acme.total_backlog, 35);
        assert_eq!(acme.total_storage_size, 2048);
        assert_eq!(acme.computed_at, t0());

        let billing = repository
            .get_aggregation(AggregationType::Namespace, "acme/billing")
            .await?
            .ok_or("billing rollup")?;
        assert_eq!((billing.topic_count, billing.total_backlog), (0, 0));

        let empty = repository
            .get_aggregation(AggregationType::Tenant, "empty")
            .await?
            .ok_or("empty tenant rollup")?;
        assert_eq!(empty.topic_count, 0);
        assert_eq!(empty.total_backlog, 0);
        assert_eq!(empty.total_msg_rate_in, 0.0);
        Ok(())
    }

    /// Test: snapshots newer than the cycle start are ignored
    ///
    /// Purpose
    /// - A collector batch committing while the aggregator runs must not be
    ///   half-visible; anything stamped after `as_of` waits for the next cycle.
    #[tokio::test]
    async fn ignores_snapshots_after_cycle_start() -> Result<(), Box<dyn std::error::Error>> {
        let repository = Arc::new(MemoryStatsRepository::new());
        repository
            .insert_batch(&[topic_snapshot("acme", "orders", "created", 10.0, t0() - ChronoDuration::seconds(30))])
            .await?;
        repository
            .insert_batch(&[
                topic_snapshot("acme", "orders", "created", 99.0, t0() + ChronoDuration::seconds(1)),
                topic_snapshot("acme", "orders", "new", 99.0, t0() + ChronoDuration::seconds(1)),
            ])
            .await?;

        let topology = StaticTopology::with_topics(
            vec![("acme", vec!["orders"])],
            vec![("acme", "orders", vec!["created", "new"])],
        );
        aggregator(topology, repository.clone(), t0()).run_once().await;

        let orders = repository
            .get_aggregation(AggregationType::Namespace, "acme/orders")
            .await?
            .ok_or("orders rollup")?;
        assert_eq!(orders.topic_count, 1);
        assert_eq!(orders.total_backlog, 10);
        Ok(())
    }

    /// Test: rollups match a direct sum over random snapshot sets
    ///
    /// Flow
    /// - 20 rounds: random tenants (some with no topics), random topics with
    ///   1..4 snapshots each at increasing times.
    ///
    /// Expected
    /// - For every tenant, total_backlog equals the sum of each topic's most
    ///   recent backlog, and topic_count the number of distinct topics.
    #[tokio::test]
    async fn rollups_match_direct_sum_for_random_sets() -> Result<(), Box<dyn std::error::Error>> {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let repository = Arc::new(MemoryStatsRepository::new());
            let tenant_count = rng.random_range(1..5);
            let mut layout: Vec<(String, Vec<String>)> = Vec::new();
            let mut listed: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
            let mut expected: BTreeMap<String, (u64, u64)> = BTreeMap::new();

            for t in 0..tenant_count {
                let tenant = format!("tenant-{}", t);
                let namespaces: Vec<String> = (0..rng.random_range(0..3)).map(|n| format!("ns-{}", n)).collect();
                let mut sum = 0u64;
                let mut topics = 0u64;
                for namespace in &namespaces {
                    let names = listed.entry((tenant.clone(), namespace.clone())).or_default();
                    for topic in 0..rng.random_range(0..6) {
                        let name = format!("topic-{}", topic);
                        names.push(name.clone());
                        let mut latest = 0u64;
                        for round in 0..rng.random_range(1..4) {
                            latest = rng.random_range(0..10_000);
                            let at = t0() - ChronoDuration::seconds(300 - round * 30);
                            repository
                                .insert_batch(&[topic_snapshot(&tenant, namespace, &name, latest as f64, at)])
                                .await?;
                        }
                        sum += latest;
                        topics += 1;
                    }
                }
                expected.insert(tenant.clone(), (topics, sum));
                layout.push((tenant, namespaces));
            }

            let topology = Arc::new(StaticTopology {
                layout: Some(layout.into_iter().collect()),
                topics: listed,
            });
            aggregator(topology, repository.clone(), t0()).run_once().await;

            for (tenant, (topics, backlog)) in expected {
                let agg = repository
                    .get_aggregation(AggregationType::Tenant, &tenant)
                    .await?
                    .ok_or("tenant rollup present")?;
                assert_eq!(agg.topic_count, topics, "topic count of {}", tenant);
                assert_eq!(agg.total_backlog, backlog, "backlog of {}", tenant);
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn derives_scopes_from_snapshots_without_topology() -> Result<(), Box<dyn std::error::Error>> {
        let repository = Arc::new(MemoryStatsRepository::new());
        repository
            .insert_batch(&[
                topic_snapshot("acme", "orders", "created", 4.0, t0()),
                topic_snapshot("acme", "billing", "invoices", 6.0, t0()),
            ])
            .await?;

        let report = aggregator(StaticTopology::unavailable(), repository.clone(), t0())
            .run_once()
            .await;
        assert_eq!(report.outcome, CycleOutcome::Success);

        let names: Vec<String> = repository
            .list_aggregations(AggregationType::Namespace)
            .await?
            .into_iter()
            .map(|agg| agg.key)
            .collect();
        assert!(names.contains(&"acme/orders".to_string()));
        assert!(names.contains(&"acme/billing".to_string()));
        let acme = repository
            .get_aggregation(AggregationType::Tenant, "acme")
            .await?
            .ok_or("acme rollup")?;
        assert_eq!(acme.total_backlog, 10);
        Ok(())
    }

    /// Test: a failing key is retried with backoff and then skipped alone
    ///
    /// Flow
    /// - Only one scope exists (tenant `acme` with no namespaces), and its
    ///   upsert fails twice before succeeding; then a second run where it
    ///   always fails.
    ///
    /// Expected
    /// - First run: 3 attempts, Success. Second run: exactly 3 attempts,
    ///   PartialFailure, nothing persisted for that key.
    #[tokio::test(start_paused = true)]
    async fn failing_upsert_is_retried_then_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let attempts = Arc::new(AtomicU32::new(0));
        let repository = Arc::new(FlakyRepository {
            inner: MemoryStatsRepository::new(),
            failures: HashMap::from([("acme".to_string(), 2)]),
            attempts: attempts.clone(),
        });
        let topology = StaticTopology::new(vec![("acme", vec![])]);

        let started = tokio::time::Instant::now();
        let report = aggregator(topology.clone(), repository.clone(), t0()).run_once().await;
        assert_eq!(report.outcome, CycleOutcome::Success);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // 500ms then 1s of backoff
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(started.elapsed() < Duration::from_secs(2));

        let attempts = Arc::new(AtomicU32::new(0));
        let hopeless = Arc::new(FlakyRepository {
            inner: MemoryStatsRepository::new(),
            failures: HashMap::from([("acme".to_string(), u32::MAX)]),
            attempts: attempts.clone(),
        });
        let report = aggregator(topology, hopeless.clone(), t0()).run_once().await;
        assert_eq!(report.outcome, CycleOutcome::PartialFailure);
        assert_eq!((report.failed, report.persisted), (1, 0));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(hopeless.get_aggregation(AggregationType::Tenant, "acme").await?.is_none());
        Ok(())
    }

    /// Test: a deleted topic stops counting towards its rollups
    ///
    /// Purpose
    /// - Snapshots outlive their topic for the retention window; rollups must
    ///   only count topics the cluster still lists.
    ///
    /// Flow
    /// - acme/orders lists only `live` (backlog 5); a two-day-old snapshot of
    ///   the deleted topic `gone` (backlog 1000) is still retained.
    ///
    /// Expected
    /// - Tenant and namespace rollups count one topic with backlog 5.
    #[tokio::test]
    async fn deleted_topic_drops_out_of_rollups() -> Result<(), Box<dyn std::error::Error>> {
        let repository = Arc::new(MemoryStatsRepository::new());
        repository
            .insert_batch(&[topic_snapshot("acme", "orders", "gone", 1000.0, t0() - ChronoDuration::days(2))])
            .await?;
        repository
            .insert_batch(&[topic_snapshot("acme", "orders", "live", 5.0, t0() - ChronoDuration::seconds(30))])
            .await?;

        let topology = StaticTopology::with_topics(
            vec![("acme", vec!["orders"])],
            vec![("acme", "orders", vec!["live"])],
        );
        aggregator(topology, repository.clone(), t0()).run_once().await;

        let acme = repository
            .get_aggregation(AggregationType::Tenant, "acme")
            .await?
            .ok_or("acme rollup")?;
        assert_eq!((acme.topic_count, acme.total_backlog), (1, 5));
        let orders = repository
            .get_aggregation(AggregationType::Namespace, "acme/orders")
            .await?
            .ok_or("orders rollup")?;
        assert_eq!((orders.topic_count, orders.total_backlog), (1, 5));
        Ok(())
    }

    /// Test: without a topic listing only recent snapshots count
    ///
    /// Flow
    /// - The topic listing of acme/orders fails; one topic was collected 30s
    ///   ago, another has not been seen for ten minutes.
    ///
    /// Expected
    /// - Only the topic inside the 60s horizon is rolled up.
    #[tokio::test]
    async fn unlisted_namespace_counts_recent_snapshots_only() -> Result<(), Box<dyn std::error::Error>> {
        let repository = Arc::new(MemoryStatsRepository::new());
        repository
            .insert_batch(&[
                topic_snapshot("acme", "orders", "fresh", 5.0, t0() - ChronoDuration::seconds(30)),
                topic_snapshot("acme", "orders", "quiet", 1000.0, t0() - ChronoDuration::minutes(10)),
            ])
            .await?;

        let topology = StaticTopology::new(vec![("acme", vec!["orders"])]);
        aggregator(topology, repository.clone(), t0()).run_once().await;

        let orders = repository
            .get_aggregation(AggregationType::Namespace, "acme/orders")
            .await?
            .ok_or("orders rollup")?;
        assert_eq!((orders.topic_count, orders.total_backlog), (1, 5));
        Ok(())
    }

    /// Test: rollups of vanished tenants and namespaces are removed
    ///
    /// Flow
    /// - Cycle 1: acme has orders and billing, globex exists.
    /// - Cycle 2: billing and globex are gone from the topology.
    /// - Cycle 3: the topology is unavailable.
    ///
    /// Expected
    /// - After cycle 2 only acme and acme/orders rollups remain.
    /// - Cycle 3 removes nothing, since scopes derived from snapshots are not
    ///   a complete listing.
    #[tokio::test]
    async fn vanished_scopes_lose_their_rollups() -> Result<(), Box<dyn std::error::Error>> {
        let repository = Arc::new(MemoryStatsRepository::new());
        let keys = |aggs: Vec<Aggregation>| aggs.into_iter().map(|a| a.key).collect::<Vec<_>>();

        let before = StaticTopology::with_topics(
            vec![("acme", vec!["orders", "billing"]), ("globex", vec![])],
            vec![("acme", "orders", vec![]), ("acme", "billing", vec![])],
        );
        aggregator(before, repository.clone(), t0()).run_once().await;
        assert_eq!(keys(repository.list_aggregations(AggregationType::Tenant).await?), vec!["acme", "globex"]);

        let after = StaticTopology::with_topics(vec![("acme", vec!["orders"])], vec![("acme", "orders", vec![])]);
        aggregator(after, repository.clone(), t0()).run_once().await;
        assert_eq!(keys(repository.list_aggregations(AggregationType::Tenant).await?), vec!["acme"]);
        assert_eq!(
            keys(repository.list_aggregations(AggregationType::Namespace).await?),
            vec!["acme/orders"]
        );

        aggregator(StaticTopology::unavailable(), repository.clone(), t0())
            .run_once()
            .await;
        assert_eq!(keys(repository.list_aggregations(AggregationType::Tenant).await?), vec!["acme"]);
        assert_eq!(
            keys(repository.list_aggregations(AggregationType::Namespace).await?),
            vec!["acme/orders"]
        );
        Ok(())
    }
}
