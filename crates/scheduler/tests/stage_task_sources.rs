//! Task-source behavior under the four distribution policies.

mod support;

use std::collections::BTreeMap;
use std::sync::Arc;

use floq_common::{DataSize, PlanNodeId, QueryId, SplitWeight};
use floq_scheduler::{
    ArbitraryDistributionTaskSource, FaultTolerantPartitioningScheme, HashDistributionTaskSource,
    HostAddress, InternalNode, SingleDistributionTaskSource, SourceDistributionTaskSource, Split,
    SplitSource, StageTaskSource, TaskDescriptor,
};
use futures::FutureExt;
use support::*;

const PN1: PlanNodeId = PlanNodeId(1);
const PN2: PlanNodeId = PlanNodeId(2);
const PN3: PlanNodeId = PlanNodeId(3);
const PN4: PlanNodeId = PlanNodeId(4);
const PN5: PlanNodeId = PlanNodeId(5);

async fn read_all_tasks(source: &mut StageTaskSource) -> Vec<TaskDescriptor> {
    let mut tasks = Vec::new();
    while !source.is_finished() {
        tasks.extend(source.more_tasks().await.expect("more tasks"));
    }
    tasks
}

fn identity_scheme(partition_count: u32) -> FaultTolerantPartitioningScheme {
    FaultTolerantPartitioningScheme::bucketed(
        partition_count,
        (0..partition_count).collect(),
        None,
    )
}

fn local_node() -> Arc<InternalNode> {
    Arc::new(InternalNode::new(
        "local",
        HostAddress::new("testaddress", 8080),
        DataSize::of_gib(16),
    ))
}

fn bucketed_scheme(partition_count: u32, bucket_count: u32) -> FaultTolerantPartitioningScheme {
    let bucket_to_partition = (0..bucket_count).map(|b| b % partition_count).collect();
    let partition_to_node = vec![local_node(); partition_count as usize];
    FaultTolerantPartitioningScheme::bucketed(
        partition_count,
        bucket_to_partition,
        Some(partition_to_node),
    )
}

fn source_distribution_source(
    split_source: TestingSplitSource,
    replicated: &floq_scheduler::HandlesByNode,
    split_batch_size: usize,
    min_splits_per_task: usize,
    split_weight_per_task: u64,
    max_splits_per_task: usize,
) -> StageTaskSource {
    StageTaskSource::Source(SourceDistributionTaskSource::new(
        QueryId(7),
        PN1,
        Some(test_catalog()),
        Box::new(split_source),
        replicated,
        split_batch_size,
        min_splits_per_task,
        SplitWeight::from_raw(split_weight_per_task),
        max_splits_per_task,
    ))
}

#[tokio::test]
async fn single_distribution_emits_one_task_with_all_splits() {
    let sources = handles_by_node(&[
        (PN1, handle(0, 123)),
        (PN1, handle(0, 222)),
        (PN2, handle(0, 321)),
    ]);
    let mut source =
        StageTaskSource::Single(SingleDistributionTaskSource::new(&sources, None));

    assert!(!source.is_finished());
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 1);
    assert!(source.is_finished());

    let task = &tasks[0];
    assert_eq!(task.partition_id, 0);
    assert!(task.node_requirements.catalog.is_none());
    assert!(task.node_requirements.addresses.is_empty());
    assert_eq!(extract_source_handles(task), sources);
    assert!(extract_connector_splits(task).is_empty());
}

#[tokio::test]
async fn coordinator_distribution_pins_the_coordinator_address() {
    let sources = handles_by_node(&[(PN1, handle(0, 123)), (PN2, handle(0, 321))]);
    let coordinator = address("coordinator:8080");
    let mut source = StageTaskSource::Single(SingleDistributionTaskSource::new(
        &sources,
        Some(coordinator.clone()),
    ));

    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 1);
    let addresses: Vec<_> = tasks[0].node_requirements.addresses.iter().collect();
    assert_eq!(addresses, vec![&coordinator]);
    assert_eq!(extract_source_handles(&tasks[0]), sources);
}

#[tokio::test]
async fn arbitrary_distribution_packs_by_size() {
    // Empty input still finishes with an empty batch.
    let mut source = StageTaskSource::Arbitrary(ArbitraryDistributionTaskSource::new(
        Vec::new(),
        &Default::default(),
        DataSize::of_bytes(3),
    ));
    assert!(!source.is_finished());
    assert!(read_all_tasks(&mut source).await.is_empty());
    assert!(source.is_finished());

    // A single handle below target forms one task.
    let mut source = StageTaskSource::Arbitrary(ArbitraryDistributionTaskSource::new(
        vec![(PN1, handle(0, 3))],
        &Default::default(),
        DataSize::of_bytes(3),
    ));
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(
        extract_source_handles(&tasks[0]),
        handles_by_node(&[(PN1, handle(0, 3))])
    );

    // Two handles that together reach the target stay in one task.
    let mut source = StageTaskSource::Arbitrary(ArbitraryDistributionTaskSource::new(
        vec![(PN1, handle(0, 1)), (PN1, handle(0, 2)), (PN2, handle(0, 4))],
        &Default::default(),
        DataSize::of_bytes(3),
    ));
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 2);
    assert_eq!(
        extract_source_handles(&tasks[0]),
        handles_by_node(&[(PN1, handle(0, 1)), (PN1, handle(0, 2))])
    );
    assert_eq!(
        extract_source_handles(&tasks[1]),
        handles_by_node(&[(PN2, handle(0, 4))])
    );
}

#[tokio::test]
async fn arbitrary_distribution_seals_before_overflow() {
    // Spec scenario: target 3B, handles {PN1: [1B, 3B], PN2: [4B]}.
    let mut source = StageTaskSource::Arbitrary(ArbitraryDistributionTaskSource::new(
        vec![(PN1, handle(0, 1)), (PN1, handle(0, 3)), (PN2, handle(0, 4))],
        &Default::default(),
        DataSize::of_bytes(3),
    ));
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 3);
    for (index, task) in tasks.iter().enumerate() {
        assert_eq!(task.partition_id, index as u32);
        assert!(task.node_requirements.addresses.is_empty());
    }
    assert_eq!(
        extract_source_handles(&tasks[0]),
        handles_by_node(&[(PN1, handle(0, 1))])
    );
    assert_eq!(
        extract_source_handles(&tasks[1]),
        handles_by_node(&[(PN1, handle(0, 3))])
    );
    assert_eq!(
        extract_source_handles(&tasks[2]),
        handles_by_node(&[(PN2, handle(0, 4))])
    );
}

#[tokio::test]
async fn arbitrary_distribution_appends_replicated_handles_to_every_task() {
    let replicated = handles_by_node(&[(PN2, handle(0, 321))]);
    let mut source = StageTaskSource::Arbitrary(ArbitraryDistributionTaskSource::new(
        vec![(PN1, handle(0, 1)), (PN1, handle(0, 2)), (PN1, handle(0, 4))],
        &replicated,
        DataSize::of_bytes(3),
    ));
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 2);
    assert_eq!(
        extract_source_handles(&tasks[0]),
        handles_by_node(&[
            (PN1, handle(0, 1)),
            (PN1, handle(0, 2)),
            (PN2, handle(0, 321)),
        ])
    );
    assert_eq!(
        extract_source_handles(&tasks[1]),
        handles_by_node(&[(PN1, handle(0, 4)), (PN2, handle(0, 321))])
    );
}

#[tokio::test]
async fn arbitrary_distribution_tasks_stay_within_target_plus_largest_handle() {
    let sizes = [5_u64, 1, 1, 9, 3, 1, 1];
    let target = 4_u64;
    let max_single = *sizes.iter().max().expect("sizes");
    let handles: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(index, size)| (PN1, handle(index as u32, *size)))
        .collect();
    let mut source = StageTaskSource::Arbitrary(ArbitraryDistributionTaskSource::new(
        handles,
        &Default::default(),
        DataSize::of_bytes(target),
    ));
    let tasks = read_all_tasks(&mut source).await;
    assert!(!tasks.is_empty());
    for task in &tasks {
        let total: u64 = extract_source_handles(&task)
            .values()
            .flatten()
            .map(|handle| handle.data_size.bytes())
            .sum();
        assert!(total <= target + max_single);
    }
}

#[tokio::test]
async fn hash_distribution_groups_exchange_handles_by_partition() {
    let mut source = StageTaskSource::Hash(HashDistributionTaskSource::new(
        BTreeMap::new(),
        handles_by_node(&[
            (PN1, handle(0, 1)),
            (PN1, handle(1, 1)),
            (PN2, handle(0, 1)),
            (PN2, handle(3, 1)),
        ]),
        &handles_by_node(&[(PN3, handle(0, 1))]),
        1,
        identity_scheme(4),
        Some(test_catalog()),
        SplitWeight::from_raw(0),
        DataSize::of_bytes(0),
    ));
    assert!(!source.is_finished());
    let tasks = read_all_tasks(&mut source).await;
    assert!(source.is_finished());
    assert_eq!(tasks.len(), 3);

    for (index, task) in tasks.iter().enumerate() {
        assert_eq!(task.partition_id, index as u32);
        assert_eq!(task.node_requirements.catalog, Some(test_catalog()));
        assert!(task.node_requirements.addresses.is_empty());
    }
    assert_eq!(
        extract_source_handles(&tasks[0]),
        handles_by_node(&[(PN1, handle(0, 1)), (PN2, handle(0, 1)), (PN3, handle(0, 1))])
    );
    assert_eq!(
        extract_source_handles(&tasks[1]),
        handles_by_node(&[(PN1, handle(1, 1)), (PN3, handle(0, 1))])
    );
    assert_eq!(
        extract_source_handles(&tasks[2]),
        handles_by_node(&[(PN2, handle(3, 1)), (PN3, handle(0, 1))])
    );
}

#[tokio::test]
async fn hash_distribution_assigns_each_bucket_its_partition() {
    // Spec scenario: 4 buckets -> 4 partitions, one split per bucket, one
    // replicated handle reaching every task.
    let b1 = bucketed_split(1, 0);
    let b2 = bucketed_split(2, 2);
    let b3 = bucketed_split(3, 3);
    let b4 = bucketed_split(4, 1);
    let mut split_sources: BTreeMap<PlanNodeId, Box<dyn SplitSource>> = BTreeMap::new();
    split_sources.insert(
        PN4,
        Box::new(TestingSplitSource::new(vec![b1.clone(), b2.clone(), b3.clone()])),
    );
    split_sources.insert(PN5, Box::new(TestingSplitSource::new(vec![b4.clone()])));

    let mut source = StageTaskSource::Hash(HashDistributionTaskSource::new(
        split_sources,
        Default::default(),
        &handles_by_node(&[(PN3, handle(0, 1))]),
        1,
        bucketed_scheme(4, 4),
        Some(test_catalog()),
        SplitWeight::from_raw(0),
        DataSize::of_bytes(0),
    ));
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 4);

    let expected_splits = [
        (PN4, b1.clone()),
        (PN5, b4.clone()),
        (PN4, b2.clone()),
        (PN4, b3.clone()),
    ];
    let partition_ids: Vec<u32> = tasks.iter().map(|task| task.partition_id).collect();
    assert_eq!(partition_ids, vec![0, 1, 2, 3]);
    for (task, (plan_node, split)) in tasks.iter().zip(expected_splits.iter()) {
        let mut expected = floq_scheduler::SplitsByNode::new();
        expected.insert(*plan_node, vec![Split::Connector(split.clone())]);
        assert_eq!(extract_connector_splits(task), expected);
        assert_eq!(
            extract_source_handles(task),
            handles_by_node(&[(PN3, handle(0, 1))])
        );
        let addresses: Vec<_> = task.node_requirements.addresses.iter().cloned().collect();
        assert_eq!(addresses, vec![address("testaddress:8080")]);
    }
}

#[tokio::test]
async fn hash_distribution_joins_partitions_by_split_weight() {
    let b1 = bucketed_split(1, 0);
    let b2 = bucketed_split(2, 2);
    let b3 = bucketed_split(3, 3);
    let b4 = bucketed_split(4, 1);
    let mut split_sources: BTreeMap<PlanNodeId, Box<dyn SplitSource>> = BTreeMap::new();
    split_sources.insert(
        PN4,
        Box::new(TestingSplitSource::new(vec![b1.clone(), b2.clone(), b3.clone()])),
    );
    split_sources.insert(PN5, Box::new(TestingSplitSource::new(vec![b4.clone()])));

    let mut source = StageTaskSource::Hash(HashDistributionTaskSource::new(
        split_sources,
        handles_by_node(&[
            (PN1, handle(0, 1)),
            (PN1, handle(1, 1)),
            (PN2, handle(1, 1)),
            (PN2, handle(2, 1)),
            (PN2, handle(3, 1)),
        ]),
        &handles_by_node(&[(PN3, handle(17, 1))]),
        2,
        bucketed_scheme(4, 4),
        Some(test_catalog()),
        SplitWeight::from_raw(2 * STANDARD_WEIGHT),
        DataSize::of_gib(100),
    ));
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 2);

    let mut expected0 = floq_scheduler::SplitsByNode::new();
    expected0.insert(PN4, vec![Split::Connector(b1)]);
    expected0.insert(PN5, vec![Split::Connector(b4)]);
    assert_eq!(extract_connector_splits(&tasks[0]), expected0);
    assert_eq!(
        extract_source_handles(&tasks[0]),
        handles_by_node(&[
            (PN1, handle(0, 1)),
            (PN1, handle(1, 1)),
            (PN2, handle(1, 1)),
            (PN3, handle(17, 1)),
        ])
    );

    let mut expected1 = floq_scheduler::SplitsByNode::new();
    expected1.insert(PN4, vec![Split::Connector(b2), Split::Connector(b3)]);
    assert_eq!(extract_connector_splits(&tasks[1]), expected1);
    assert_eq!(
        extract_source_handles(&tasks[1]),
        handles_by_node(&[
            (PN2, handle(2, 1)),
            (PN2, handle(3, 1)),
            (PN3, handle(17, 1)),
        ])
    );
}

#[tokio::test]
async fn hash_distribution_joins_partitions_by_exchange_size() {
    let b1 = bucketed_split(1, 0);
    let b2 = bucketed_split(2, 2);
    let b3 = bucketed_split(3, 3);
    let b4 = bucketed_split(4, 1);
    let mut split_sources: BTreeMap<PlanNodeId, Box<dyn SplitSource>> = BTreeMap::new();
    split_sources.insert(
        PN4,
        Box::new(TestingSplitSource::new(vec![b1.clone(), b2.clone(), b3.clone()])),
    );
    split_sources.insert(PN5, Box::new(TestingSplitSource::new(vec![b4.clone()])));

    let mut source = StageTaskSource::Hash(HashDistributionTaskSource::new(
        split_sources,
        handles_by_node(&[
            (PN1, handle(0, 20)),
            (PN1, handle(1, 30)),
            (PN2, handle(1, 20)),
            (PN2, handle(2, 99)),
            (PN2, handle(3, 30)),
        ]),
        &handles_by_node(&[(PN3, handle(17, 1))]),
        2,
        bucketed_scheme(4, 4),
        Some(test_catalog()),
        SplitWeight::from_raw(100 * STANDARD_WEIGHT),
        DataSize::of_bytes(100),
    ));
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 3);

    assert_eq!(
        extract_source_handles(&tasks[0]),
        handles_by_node(&[
            (PN1, handle(0, 20)),
            (PN1, handle(1, 30)),
            (PN2, handle(1, 20)),
            (PN3, handle(17, 1)),
        ])
    );
    assert_eq!(
        extract_source_handles(&tasks[1]),
        handles_by_node(&[(PN2, handle(2, 99)), (PN3, handle(17, 1))])
    );
    assert_eq!(
        extract_source_handles(&tasks[2]),
        handles_by_node(&[(PN2, handle(3, 30)), (PN3, handle(17, 1))])
    );
}

#[tokio::test]
async fn hash_distribution_waits_for_every_split_source() {
    let (tx1, pending1) = TestingSplitSource::pending();
    let (tx2, pending2) = TestingSplitSource::pending();
    let mut split_sources: BTreeMap<PlanNodeId, Box<dyn SplitSource>> = BTreeMap::new();
    split_sources.insert(PN1, Box::new(pending1));
    split_sources.insert(PN2, Box::new(pending2));

    let mut source = StageTaskSource::Hash(HashDistributionTaskSource::new(
        split_sources,
        Default::default(),
        &handles_by_node(&[(PN3, handle(0, 1))]),
        1,
        bucketed_scheme(4, 4),
        Some(test_catalog()),
        SplitWeight::from_raw(0),
        DataSize::of_bytes(0),
    ));

    let tasks = {
        let fut = source.more_tasks();
        futures::pin_mut!(fut);
        assert!(futures::poll!(fut.as_mut()).is_pending());

        tx1.send(vec![bucketed_split(1, 0), bucketed_split(2, 2), bucketed_split(3, 3)])
            .expect("first source fed");
        assert!(futures::poll!(fut.as_mut()).is_pending());

        tx2.send(vec![bucketed_split(4, 1)]).expect("second source fed");
        fut.as_mut().await.expect("tasks")
    };
    assert_eq!(tasks.len(), 4);
    for task in &tasks {
        assert_eq!(task.split_count(), 2);
    }
    assert!(source.is_finished());
}

#[tokio::test]
async fn source_distribution_handles_empty_source() {
    let mut source = source_distribution_source(
        TestingSplitSource::new(Vec::new()),
        &Default::default(),
        2,
        0,
        3 * STANDARD_WEIGHT,
        1000,
    );
    assert!(!source.is_finished());
    assert!(source.more_tasks().await.expect("batch").is_empty());
    assert!(source.is_finished());
}

#[tokio::test]
async fn source_distribution_batches_by_weight_with_tail() {
    let mut source = source_distribution_source(
        TestingSplitSource::new(vec![split(1), split(2), split(3)]),
        &Default::default(),
        3,
        0,
        2 * STANDARD_WEIGHT,
        1000,
    );
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].split_count(), 2);
    assert_eq!(tasks[1].split_count(), 1);
    assert_eq!(tasks[0].partition_id, 0);
    assert_eq!(tasks[1].partition_id, 1);
    for task in &tasks {
        assert_eq!(task.node_requirements.catalog, Some(test_catalog()));
        assert!(task.node_requirements.addresses.is_empty());
    }
}

#[tokio::test]
async fn source_distribution_appends_replicated_handles() {
    let replicated = handles_by_node(&[(PN2, handle(0, 1))]);
    let mut source = source_distribution_source(
        TestingSplitSource::new(vec![split(1), split(2), split(3)]),
        &replicated,
        2,
        0,
        2 * STANDARD_WEIGHT,
        1000,
    );
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].split_count(), 3);
    assert_eq!(tasks[1].split_count(), 2);
    for task in &tasks {
        assert_eq!(extract_source_handles(task), replicated);
    }
}

#[tokio::test]
async fn source_distribution_anchors_tasks_at_split_addresses() {
    let splits = vec![
        addressed_split(1, STANDARD_WEIGHT, &["host1:8080", "host2:8080"]),
        addressed_split(2, STANDARD_WEIGHT, &["host2:8080"]),
        addressed_split(3, STANDARD_WEIGHT, &["host1:8080", "host3:8080"]),
        addressed_split(4, STANDARD_WEIGHT, &["host3:8080", "host1:8080"]),
        addressed_split(5, STANDARD_WEIGHT, &["host1:8080", "host2:8080"]),
        addressed_split(6, STANDARD_WEIGHT, &["host2:8080", "host3:8080"]),
        addressed_split(7, STANDARD_WEIGHT, &["host3:8080", "host4:8080"]),
    ];
    let mut source = source_distribution_source(
        TestingSplitSource::new(splits.clone()),
        &Default::default(),
        3,
        0,
        2 * STANDARD_WEIGHT,
        1000,
    );
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 4);

    let mut seen = 0;
    for task in &tasks {
        let anchor = task
            .node_requirements
            .addresses
            .iter()
            .next()
            .expect("anchored task");
        assert_eq!(task.node_requirements.addresses.len(), 1);
        for node_splits in extract_connector_splits(task).values() {
            for split in node_splits {
                let connector = split.as_connector().expect("connector split");
                assert!(connector.addresses.contains(anchor));
                seen += 1;
            }
        }
    }
    assert_eq!(seen, splits.len());
}

#[tokio::test]
async fn source_distribution_respects_weights() {
    let light = STANDARD_WEIGHT / 2;
    let heavy = 2 * STANDARD_WEIGHT;
    let mut source = source_distribution_source(
        TestingSplitSource::new(vec![
            weighted_split(21, light),
            weighted_split(22, light),
            weighted_split(1, STANDARD_WEIGHT),
            weighted_split(11, heavy),
            weighted_split(12, heavy),
            weighted_split(24, light),
        ]),
        &Default::default(),
        1,
        0,
        (19 * STANDARD_WEIGHT) / 10,
        1000,
    );
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 4);
    assert_eq!(split_ids(&tasks[0]), vec![21, 22, 1]);
    assert_eq!(split_ids(&tasks[1]), vec![11]);
    assert_eq!(split_ids(&tasks[2]), vec![12]);
    assert_eq!(split_ids(&tasks[3]), vec![24]);
}

#[tokio::test]
async fn source_distribution_honors_min_splits_per_task() {
    let light = STANDARD_WEIGHT / 2;
    let heavy = 2 * STANDARD_WEIGHT;
    let mut source = source_distribution_source(
        TestingSplitSource::new(vec![
            weighted_split(11, heavy),
            weighted_split(12, heavy),
            weighted_split(13, heavy),
            weighted_split(21, light),
            weighted_split(22, light),
            weighted_split(23, light),
            weighted_split(24, light),
        ]),
        &Default::default(),
        1,
        2,
        2 * STANDARD_WEIGHT,
        1000,
    );
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 3);
    assert_eq!(split_ids(&tasks[0]), vec![11, 12]);
    assert_eq!(split_ids(&tasks[1]), vec![13, 21]);
    assert_eq!(split_ids(&tasks[2]), vec![22, 23, 24]);
}

#[tokio::test]
async fn source_distribution_honors_max_splits_per_task() {
    let light = STANDARD_WEIGHT / 2;
    let heavy = 2 * STANDARD_WEIGHT;
    let mut source = source_distribution_source(
        TestingSplitSource::new(vec![
            weighted_split(21, light),
            weighted_split(22, light),
            weighted_split(23, light),
            weighted_split(11, heavy),
            weighted_split(24, light),
        ]),
        &Default::default(),
        1,
        0,
        2 * STANDARD_WEIGHT,
        3,
    );
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 3);
    assert_eq!(split_ids(&tasks[0]), vec![21, 22, 23]);
    assert_eq!(split_ids(&tasks[1]), vec![11]);
    assert_eq!(split_ids(&tasks[2]), vec![24]);
}

#[tokio::test]
async fn source_distribution_groups_addressed_splits() {
    let light = STANDARD_WEIGHT / 2;
    let heavy = 2 * STANDARD_WEIGHT;
    let mut source = source_distribution_source(
        TestingSplitSource::new(vec![
            addressed_split(1, STANDARD_WEIGHT, &["host1:8080"]),
            addressed_split(12, heavy, &["host2:8080"]),
            addressed_split(3, STANDARD_WEIGHT, &["host1:8080"]),
            addressed_split(21, light, &["host1:8080"]),
        ]),
        &Default::default(),
        1,
        0,
        2 * STANDARD_WEIGHT,
        3,
    );
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 3);
    assert_eq!(split_ids(&tasks[0]), vec![12]);
    assert_eq!(split_ids(&tasks[1]), vec![1, 3]);
    assert_eq!(split_ids(&tasks[2]), vec![21]);
}

#[tokio::test]
async fn source_distribution_anchors_shared_splits_at_largest_group() {
    let mut source = source_distribution_source(
        TestingSplitSource::new(vec![
            addressed_split(1, STANDARD_WEIGHT, &["host1:8080"]),
            addressed_split(3, STANDARD_WEIGHT, &["host1:8080", "host2:8080"]),
            addressed_split(2, STANDARD_WEIGHT, &["host2:8080"]),
        ]),
        &Default::default(),
        1,
        0,
        2 * STANDARD_WEIGHT,
        3,
    );
    let tasks = read_all_tasks(&mut source).await;
    assert_eq!(tasks.len(), 2);
    assert_eq!(split_ids(&tasks[0]), vec![1, 3]);
    assert_eq!(split_ids(&tasks[1]), vec![2]);
}

#[tokio::test]
async fn source_distribution_always_emits_the_incomplete_tail() {
    for target_splits_per_task in 1..=8_usize {
        let splits: Vec<_> = (0..=target_splits_per_task as u64)
            .map(|id| weighted_split(id, STANDARD_WEIGHT))
            .collect();
        for finish_delay_iterations in 1..5 {
            for split_batch_size in 1..=3 {
                let mut source = source_distribution_source(
                    TestingSplitSource::with_finish_delay(
                        splits.clone(),
                        finish_delay_iterations,
                    ),
                    &Default::default(),
                    split_batch_size,
                    target_splits_per_task,
                    STANDARD_WEIGHT * target_splits_per_task as u64,
                    target_splits_per_task,
                );
                let tasks = read_all_tasks(&mut source).await;
                assert_eq!(tasks.len(), 2);
                assert_eq!(tasks.last().expect("tail task").split_count(), 1);
            }
        }
    }
}

#[tokio::test]
async fn source_distribution_waits_for_async_split_source() {
    let (tx, pending) = TestingSplitSource::pending();
    let mut source = source_distribution_source(
        pending,
        &Default::default(),
        2,
        0,
        2 * STANDARD_WEIGHT,
        1000,
    );

    {
        let fut = source.more_tasks();
        futures::pin_mut!(fut);
        assert!(futures::poll!(fut.as_mut()).is_pending());
        tx.send(vec![split(1), split(2), split(3)]).expect("splits fed");
        let tasks = fut.await.expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].split_count(), 2);
    }

    let tasks = source
        .more_tasks()
        .now_or_never()
        .expect("tail batch ready")
        .expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].split_count(), 1);
    assert!(source.is_finished());
}

fn split_ids(task: &TaskDescriptor) -> Vec<u64> {
    extract_connector_splits(task)
        .values()
        .flatten()
        .filter_map(|split| split.as_connector())
        .filter_map(|connector| connector.payload.get("id").and_then(|id| id.as_u64()))
        .collect()
}
