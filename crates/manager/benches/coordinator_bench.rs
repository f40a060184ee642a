use common::message::CommitRequest;
use common::{CorrelationId, ProcessHandle, ResourceId, Xid};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use manager::{Coordinator, ManagerConfig, ManagerHandle, ResourceConfig, TransactionManager};
use transaction_log::InMemoryTransactionLog;
use xa::{InMemoryResourceManager, SwitchRegistry};

fn start(rt: &tokio::runtime::Runtime, resources: usize) -> ManagerHandle {
    let mut registry = SwitchRegistry::new();
    let mut configs = Vec::new();
    for i in 0..resources {
        let key = format!("memory-{i}");
        registry.register_in_memory(key.clone(), InMemoryResourceManager::new(&key));
        configs.push(ResourceConfig::new(key.clone(), key));
    }
    let config = ManagerConfig::default().with_resources(configs);

    rt.block_on(async {
        let (handle, _task) = Coordinator::spawn(config, InMemoryTransactionLog::new(), &registry)
            .await
            .unwrap();
        handle
    })
}

fn bench_commit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("coordinator/commit");

    for resources in [1usize, 2, 4] {
        let handle = start(&rt, resources);
        let ids: Vec<ResourceId> = (1..=resources as i32).map(ResourceId::new).collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(resources),
            &ids,
            |b, ids| {
                b.iter(|| {
                    rt.block_on(async {
                        let request = CommitRequest {
                            correlation: CorrelationId::new(),
                            xid: Xid::new(),
                            process: ProcessHandle::new(1, 1),
                            resources: ids.clone(),
                        };
                        let replies = handle.commit(request).await.unwrap();
                        replies.outcome().await.unwrap();
                    });
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_commit);
criterion_main!(benches);
