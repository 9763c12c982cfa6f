//! Unordered streaming merge: fan-in of per-shard producers into a single
//! channel, first-ready-first-served. No global ordering guarantee; items
//! interleave in whatever order producers happen to yield them.

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ShardisError;
use crate::ring::ShardId;

use super::observer::guarded;
use super::{MergeConfig, MergedItem, MergeObserver, ShardProducer, StopReason};

/// A merge-internal item sink abstracting over a bounded or unbounded
/// `tokio::sync::mpsc` sender, so the producer loop doesn't need to know
/// which flavor a given run is using.
enum ItemTx<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for ItemTx<T> {
    fn clone(&self) -> Self {
        match self {
            ItemTx::Bounded(tx) => ItemTx::Bounded(tx.clone()),
            ItemTx::Unbounded(tx) => ItemTx::Unbounded(tx.clone()),
        }
    }
}

enum ItemRx<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> ItemRx<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            ItemRx::Bounded(rx) => rx.recv().await,
            ItemRx::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Runs every producer concurrently, fanning items into a single bounded or
/// unbounded channel. Each producer is spawned as its own task so a slow or
/// stalled shard cannot block the others; fan-in backpressure is observed
/// when a producer's `send` cannot complete immediately (bounded channels
/// only — an unbounded channel never blocks a producer). Cancelling
/// `cancellation` stops every producer from pulling further items and
/// marks it `StopReason::Canceled`, rather than running fan-out to
/// completion after the caller has lost interest.
pub fn merge_unordered<T: Send + 'static>(
    producers: Vec<ShardProducer<T>>,
    config: MergeConfig,
    observer: std::sync::Arc<dyn MergeObserver>,
    cancellation: CancellationToken,
) -> BoxStream<'static, Result<MergedItem<T>, ShardisError>> {
    let (tx, rx) = match config.channel_capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (ItemTx::Bounded(tx), ItemRx::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (ItemTx::Unbounded(tx), ItemRx::Unbounded(rx))
        }
    };

    for producer in producers {
        let tx = tx.clone();
        let observer = observer.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(run_producer(producer, tx, observer, cancellation));
    }
    drop(tx);

    tokio_stream_from_receiver(rx).boxed()
}

async fn run_producer<T: Send + 'static>(
    producer: ShardProducer<T>,
    tx: ItemTx<Result<MergedItem<T>, ShardisError>>,
    observer: std::sync::Arc<dyn MergeObserver>,
    cancellation: CancellationToken,
) {
    let ShardProducer { shard_id, mut stream } = producer;
    let mut stop_reason = StopReason::Completed;

    loop {
        let item = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                stop_reason = StopReason::Canceled;
                break;
            }
            item = stream.next() => item,
        };
        let Some(item) = item else { break };

        let is_err = item.is_err();
        let to_send = item.map(|value| MergedItem {
            shard_id: shard_id.clone(),
            value,
        });

        if try_send_with_backpressure(&tx, to_send, &shard_id, &observer)
            .await
            .is_err()
        {
            // Receiver dropped (merge consumer lost interest); stop quietly.
            stop_reason = StopReason::Canceled;
            break;
        }

        if is_err {
            stop_reason = StopReason::Faulted;
            break;
        }

        dispatch_item_yielded(&observer, &shard_id);
    }

    dispatch_shard_stopped(&observer, &shard_id, stop_reason);
}

async fn try_send_with_backpressure<T>(
    tx: &ItemTx<T>,
    item: T,
    shard_id: &ShardId,
    observer: &std::sync::Arc<dyn MergeObserver>,
) -> Result<(), ()> {
    match tx {
        ItemTx::Unbounded(tx) => tx.send(item).map_err(|_| ()),
        ItemTx::Bounded(tx) => match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => {
                dispatch_backpressure_start(observer, shard_id);
                let result = tx.send(item).await;
                dispatch_backpressure_stop(observer, shard_id);
                result.map_err(|_| ())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(()),
        },
    }
}

fn dispatch_item_yielded(observer: &std::sync::Arc<dyn MergeObserver>, shard_id: &ShardId) {
    let observer = observer.clone();
    let shard_id = shard_id.clone();
    guarded(move || observer.on_item_yielded(&shard_id));
}

fn dispatch_shard_stopped(
    observer: &std::sync::Arc<dyn MergeObserver>,
    shard_id: &ShardId,
    reason: StopReason,
) {
    let observer = observer.clone();
    let shard_id = shard_id.clone();
    guarded(move || {
        if reason == StopReason::Completed {
            observer.on_shard_completed(&shard_id);
        }
        observer.on_shard_stopped(&shard_id, reason);
    });
}

fn dispatch_backpressure_start(observer: &std::sync::Arc<dyn MergeObserver>, shard_id: &ShardId) {
    let observer = observer.clone();
    let shard_id = shard_id.clone();
    guarded(move || observer.on_backpressure_wait_start(&shard_id));
}

fn dispatch_backpressure_stop(observer: &std::sync::Arc<dyn MergeObserver>, shard_id: &ShardId) {
    let observer = observer.clone();
    let shard_id = shard_id.clone();
    guarded(move || observer.on_backpressure_wait_stop(&shard_id));
}

fn tokio_stream_from_receiver<T: Send + 'static>(
    rx: ItemRx<Result<MergedItem<T>, ShardisError>>,
) -> impl futures::Stream<Item = Result<MergedItem<T>, ShardisError>> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
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

    #[tokio::test]
    async fn yields_every_item_from_every_producer() {
        let producers = vec![
            producer("a", vec![1, 2, 3]),
            producer("b", vec![4, 5]),
        ];
        let merged = merge_unordered(
            producers,
            MergeConfig::default(),
            std::sync::Arc::new(NoopObserver),
            CancellationToken::new(),
        );
        let items: Vec<_> = merged.collect().await;
        let mut values: Vec<i32> = items.into_iter().map(|r| r.unwrap().value).collect();
        values.sort();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn propagates_a_producer_error() {
        let err_stream = fstream::iter(vec![Ok(1), Err(ShardisError::ShardUnavailable(
            ShardId::new("a").unwrap(),
        ))])
        .boxed();
        let producers = vec![ShardProducer::new(ShardId::new("a").unwrap(), err_stream)];
        let merged = merge_unordered(
            producers,
            MergeConfig::default(),
            std::sync::Arc::new(NoopObserver),
            CancellationToken::new(),
        );
        let items: Vec<_> = merged.collect().await;
        assert!(items.iter().any(|r| r.is_err()));
    }
}
