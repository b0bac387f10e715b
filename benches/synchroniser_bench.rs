//! # Synchroniser Benchmark
//!
//! Measures how fast a node's input buffers drain under the bundled
//! synchronisers: every origin is filled, then batches are taken until the
//! policy selects nothing.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use tributary::node::InputQueue;
use tributary::synchroniser::{OnePerOrigin, Passthrough, Synchroniser};
use tributary::{Message, ObjectPayload};

const ORIGINS: [&str; 4] = ["camera", "microphone", "detector", "tracker"];

/// Fills every origin with `per_origin` messages and drains the queue.
/// Returns the number of batches taken.
fn drain(synchroniser: &dyn Synchroniser, messages: &[Arc<Message>]) -> usize {
  let queue = InputQueue::new("bench", ORIGINS, None);
  for origin in ORIGINS {
    for message in messages {
      queue.deliver(origin, Arc::clone(message));
    }
  }
  let mut batches = 0;
  while let Ok(Some(batch)) = queue.take_batch(synchroniser) {
    black_box(batch.len());
    batches += 1;
  }
  batches
}

fn synchroniser_benchmark(c: &mut Criterion) {
  let mut group = c.benchmark_group("synchroniser_drain");
  group.sample_size(10);
  group.warm_up_time(std::time::Duration::from_secs(1));
  group.measurement_time(std::time::Duration::from_secs(3));

  for size in [100, 1000, 10000].iter() {
    let messages: Vec<Arc<Message>> = (0..*size as u64)
      .map(|version| Arc::new(Message::new("bench", version, ObjectPayload::new().with("index", version))))
      .collect();
    group.throughput(Throughput::Elements((*size * ORIGINS.len()) as u64));

    group.bench_with_input(BenchmarkId::new("passthrough", size), &messages, |b, messages| {
      b.iter(|| assert_eq!(drain(&Passthrough, messages), 1));
    });
    group.bench_with_input(BenchmarkId::new("one_per_origin", size), &messages, |b, messages| {
      b.iter(|| assert_eq!(drain(&OnePerOrigin, messages), messages.len()));
    });
  }

  group.finish();
}

criterion_group!(benches, synchroniser_benchmark);
criterion_main!(benches);
