//! Ordered merges: `merge_ordered_streaming` runs a k-way merge over
//! per-shard bounded buffers as items arrive; `merge_ordered_eager`
//! materializes every shard's stream fully before merging. Both require
//! each input stream to already be sorted by the merge key; neither
//! re-sorts a shard's own output.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::error::ShardisError;
use crate::ring::ShardId;

use super::observer::guarded;
use super::{MergeConfig, MergedItem, MergeObserver, ShardProducer, StopReason};

/// A key extractor: projects a merge item onto its comparison key. Kept as
/// a plain function pointer rather than a trait so callers can merge by
/// any field without wrapping their item type.
pub type KeyOf<T, O> = fn(&T) -> O;

struct HeapEntry<T, O: Ord> {
    key: O,
    shard_index: usize,
    sequence: u64,
    value: T,
}

impl<T, O: Ord> PartialEq for HeapEntry<T, O> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.shard_index == other.shard_index
    }
}
impl<T, O: Ord> Eq for HeapEntry<T, O> {}

impl<T, O: Ord> PartialOrd for HeapEntry<T, O> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T, O: Ord> Ord for HeapEntry<T, O> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse key order so the smallest key
        // pops first, and break ties by (shard_index, sequence) so two
        // shards offering an identical key still merge deterministically.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.shard_index.cmp(&self.shard_index))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Streaming k-way merge: each shard feeds a bounded per-shard buffer of
/// capacity `config.prefetch_per_shard`; a central task pops the smallest
/// head across all buffers, topping up the source buffer after every pop.
/// Memory is bounded by `prefetch_per_shard * shard_count`, independent of
/// result size.
pub fn merge_ordered_streaming<T, O>(
    producers: Vec<ShardProducer<T>>,
    key_of: KeyOf<T, O>,
    config: MergeConfig,
    observer: Arc<dyn MergeObserver>,
) -> BoxStream<'static, Result<MergedItem<T>, ShardisError>>
where
    T: Send + 'static,
    O: Ord + Send + 'static,
{
    let shard_count = producers.len();
    let mut buffer_rxs = Vec::with_capacity(shard_count);
    let shard_ids: Vec<ShardId> = producers.iter().map(|p| p.shard_id.clone()).collect();

    for producer in producers {
        let (tx, rx) = mpsc::channel(config.prefetch_per_shard.max(1));
        let observer = observer.clone();
        tokio::spawn(feed_buffer(producer, tx, observer));
        buffer_rxs.push(rx);
    }

    let state = StreamingMergeState {
        buffer_rxs,
        shard_ids,
        heap: BinaryHeap::new(),
        sequences: vec![0u64; shard_count],
        started: false,
        pending_error: None,
        key_of,
        observer,
        heap_samples_emitted: 0u64,
        heap_sample_every: config.heap_sample_every.max(1),
    };

    stream::unfold(state, streaming_step).boxed()
}

struct StreamingMergeState<T, O: Ord> {
    buffer_rxs: Vec<mpsc::Receiver<Result<T, ShardisError>>>,
    shard_ids: Vec<ShardId>,
    heap: BinaryHeap<HeapEntry<T, O>>,
    sequences: Vec<u64>,
    started: bool,
    /// An error observed while topping up a buffer after a pop; surfaced
    /// on the *next* step so the already-popped item is still delivered.
    pending_error: Option<ShardisError>,
    key_of: KeyOf<T, O>,
    observer: Arc<dyn MergeObserver>,
    heap_samples_emitted: u64,
    heap_sample_every: usize,
}

async fn streaming_step<T, O>(
    mut state: StreamingMergeState<T, O>,
) -> Option<(Result<MergedItem<T>, ShardisError>, StreamingMergeState<T, O>)>
where
    T: Send + 'static,
    O: Ord + Send + 'static,
{
    if let Some(err) = state.pending_error.take() {
        return Some((Err(err), state));
    }

    if !state.started {
        for index in 0..state.buffer_rxs.len() {
            if let Some(err) = recv_and_push(&mut state, index).await {
                state.pending_error = None;
                return Some((Err(err), state));
            }
        }
        state.started = true;
    }

    let popped = state.heap.pop()?;
    let shard_id = state.shard_ids[popped.shard_index].clone();

    maybe_sample_heap_size(&mut state);

    if let Some(err) = recv_and_push(&mut state, popped.shard_index).await {
        state.pending_error = Some(err);
    }

    dispatch_item_yielded(&state.observer, &shard_id);
    Some((
        Ok(MergedItem {
            shard_id,
            value: popped.value,
        }),
        state,
    ))
}

async fn recv_and_push<T, O>(
    state: &mut StreamingMergeState<T, O>,
    shard_index: usize,
) -> Option<ShardisError>
where
    O: Ord,
{
    match state.buffer_rxs[shard_index].recv().await {
        Some(Ok(value)) => {
            let key = (state.key_of)(&value);
            let sequence = state.sequences[shard_index];
            state.sequences[shard_index] += 1;
            state.heap.push(HeapEntry {
                key,
                shard_index,
                sequence,
                value,
            });
            None
        }
        Some(Err(err)) => Some(err),
        None => None,
    }
}

fn maybe_sample_heap_size<T, O: Ord>(state: &mut StreamingMergeState<T, O>) {
    state.heap_samples_emitted += 1;
    if state.heap_samples_emitted as usize % state.heap_sample_every != 0 {
        return;
    }
    let size = state.heap.len();
    let observer = state.observer.clone();
    guarded(move || observer.on_heap_size_sample(size));
}

async fn feed_buffer<T: Send + 'static>(
    producer: ShardProducer<T>,
    tx: mpsc::Sender<Result<T, ShardisError>>,
    observer: Arc<dyn MergeObserver>,
) {
    let ShardProducer { shard_id, mut stream } = producer;
    let mut stop_reason = StopReason::Completed;

    while let Some(item) = stream.next().await {
        let is_err = item.is_err();
        if tx.send(item).await.is_err() {
            stop_reason = StopReason::Canceled;
            break;
        }
        if is_err {
            stop_reason = StopReason::Faulted;
            break;
        }
    }

    let observer2 = observer.clone();
    let shard_id2 = shard_id.clone();
    guarded(move || {
        if stop_reason == StopReason::Completed {
            observer2.on_shard_completed(&shard_id2);
        }
        observer2.on_shard_stopped(&shard_id2, stop_reason);
    });
}

fn dispatch_item_yielded(observer: &Arc<dyn MergeObserver>, shard_id: &ShardId) {
    let observer = observer.clone();
    let shard_id = shard_id.clone();
    guarded(move || observer.on_item_yielded(&shard_id));
}

/// Eager merge: fully materializes every shard stream in parallel, then
/// performs the same key-ordered merge over in-memory vectors. Simpler and
/// lower-latency-to-first-result for small result sets; memory scales with
/// total result size rather than `prefetch_per_shard`.
pub async fn merge_ordered_eager<T, O>(
    producers: Vec<ShardProducer<T>>,
    key_of: KeyOf<T, O>,
    observer: Arc<dyn MergeObserver>,
) -> Result<Vec<MergedItem<T>>, ShardisError>
where
    T: Send + 'static,
    O: Ord + Send + 'static,
{
    let materialized = futures::future::join_all(producers.into_iter().map(|producer| {
        let observer = observer.clone();
        async move {
            let ShardProducer { shard_id, stream } = producer;
            let items: Vec<Result<T, ShardisError>> = stream.collect().await;
            let mut stop_reason = StopReason::Completed;
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Ok(value) => values.push(value),
                    Err(err) => {
                        stop_reason = StopReason::Faulted;
                        return (shard_id, Err(err));
                    }
                }
            }
            let observer2 = observer.clone();
            let shard_id2 = shard_id.clone();
            guarded(move || {
                if stop_reason == StopReason::Completed {
                    observer2.on_shard_completed(&shard_id2);
                }
                observer2.on_shard_stopped(&shard_id2, stop_reason);
            });
            (shard_id, Ok(values))
        }
    }))
    .await;

    let mut heap: BinaryHeap<HeapEntry<(ShardId, T), O>> = BinaryHeap::new();
    for (shard_index, (shard_id, values)) in materialized.into_iter().enumerate() {
        let values = values?;
        for (sequence, value) in values.into_iter().enumerate() {
            let key = key_of(&value);
            heap.push(HeapEntry {
                key,
                shard_index,
                sequence: sequence as u64,
                value: (shard_id.clone(), value),
            });
        }
    }

    let mut out = Vec::with_capacity(heap.len());
    while let Some(entry) = heap.pop() {
        let (shard_id, value) = entry.value;
        dispatch_item_yielded(&observer, &shard_id);
        out.push(MergedItem { shard_id, value });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::NoopObserver;
    use futures::stream as fstream;

    fn producer(id: &str, items: Vec<i32>) -> ShardProducer<i32> {
        ShardProducer::new(
            ShardId::new(id).unwrap(),
            fstream::iter(items.into_iter().map(Ok)).boxed(),
        )
    }

    fn identity(v: &i32) -> i32 {
        *v
    }

    #[tokio::test]
    async fn streaming_merge_preserves_global_order() {
        let producers = vec![
            producer("a", vec![1, 3, 5, 7]),
            producer("b", vec![2, 4, 6]),
        ];
        let merged = merge_ordered_streaming(
            producers,
            identity,
            MergeConfig::default(),
            Arc::new(NoopObserver),
        );
        let items: Vec<i32> = merged
            .map(|r| r.unwrap().value)
            .collect()
            .await;
        assert_eq!(items, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn eager_merge_preserves_global_order_with_duplicates() {
        let producers = vec![
            producer("a", vec![1, 2, 2]),
            producer("b", vec![2, 3]),
        ];
        let merged = merge_ordered_eager(producers, identity, Arc::new(NoopObserver))
            .await
            .unwrap();
        let values: Vec<i32> = merged.into_iter().map(|m| m.value).collect();
        assert_eq!(values, vec![1, 2, 2, 2, 3]);
    }
}
