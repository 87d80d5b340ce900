use std::sync::Arc;

use context_memory::{
    ConsolidationScope, EngineConfig, ExperienceDetails, HashingEmbedding, KnowledgeDetails,
    MemoryContext, MemoryEngine, NodeDetails, NodeProposal,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

const TOPICS: &[&str] = &[
    "rust", "borrow", "checker", "rocksdb", "column", "family", "tokio", "runtime", "graph",
    "memory", "decay", "presentation", "meeting", "deadline", "review", "coffee",
];

fn text_for(i: usize) -> String {
    (0..6)
        .map(|k| TOPICS[(i * 7 + k * 3) % TOPICS.len()])
        .collect::<Vec<_>>()
        .join(" ")
        + &format!(" note{}", i)
}

fn proposal(i: usize) -> NodeProposal {
    let content = text_for(i);
    let details = if i % 2 == 0 {
        NodeDetails::Knowledge(KnowledgeDetails {
            concept: format!("concept-{}", i),
            definition: content.clone(),
            how_to_use: vec![],
            understanding_level: 0.5,
            category: None,
            related_concepts: Default::default(),
        })
    } else {
        NodeDetails::Experience(ExperienceDetails {
            event_type: "session".into(),
            participants: Default::default(),
            lessons_learned: vec![content.clone()],
            location: None,
            insights: vec![],
        })
    };
    NodeProposal::new(details, content).with_relevance(MemoryContext::Current, 0.5)
}

fn populated_engine(rt: &Runtime, size: usize) -> MemoryEngine {
    let config = EngineConfig::default();
    let dimension = config.embedding_dimension;
    let engine = MemoryEngine::in_memory(config)
        .unwrap()
        .with_embedder(Arc::new(HashingEmbedding::new(dimension).unwrap()))
        .unwrap();
    rt.block_on(async {
        for i in 0..size {
            engine.propose_node(proposal(i)).await.unwrap();
        }
    });
    engine
}

fn bench_propose(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = populated_engine(&rt, 200);
    let mut i = 200;

    c.bench_function("propose_node_200", |b| {
        b.iter(|| {
            i += 1;
            rt.block_on(engine.propose_node(proposal(i))).unwrap()
        })
    });
}

fn bench_retrieve(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("retrieve_text");

    for size in [100usize, 1000] {
        let engine = populated_engine(&rt, size);
        rt.block_on(engine.run_consolidation(ConsolidationScope::All))
            .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), &engine, |b, engine| {
            b.iter(|| {
                engine
                    .retrieve_text(
                        black_box("rocksdb deadline review"),
                        Some(MemoryContext::Current),
                        None,
                    )
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_consolidation(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = populated_engine(&rt, 500);

    c.bench_function("sweep_decay_500", |b| {
        b.iter(|| rt.block_on(engine.sweep_decay(ConsolidationScope::All)).unwrap())
    });
}

criterion_group!(benches, bench_propose, bench_retrieve, bench_consolidation);
criterion_main!(benches);
