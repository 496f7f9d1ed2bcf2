//! # Stream aggregation
//!
//! Observing advisors often need the whole response (to log it, store it,
//! decode it) while the caller still wants fragments as they arrive.
//! [`StreamAggregator`] sits on the fragment stream as a pass-through fold:
//! every fragment is forwarded untouched and in order, and when the terminal
//! fragment arrives the concatenated response is handed to a one-shot
//! completion callback.
//!
//! The callback never fires if the stream fails, is cancelled, is dropped, or
//! ends without a terminal fragment.
//!
//! ```
//! use advisor_pipeline::aggregator::with_completion;
//! use advisor_pipeline::{Fragment, FragmentStream};
//! use futures::StreamExt;
//!
//! # tokio_test::block_on(async {
//! let upstream: FragmentStream = Box::pin(futures::stream::iter(vec![
//!     Ok(Fragment::fragment("Hel")),
//!     Ok(Fragment::fragment("lo")),
//!     Ok(Fragment::terminal()),
//! ]));
//! let (stream, completion) = with_completion(upstream);
//! let forwarded: Vec<_> = stream.collect().await;
//! assert_eq!(forwarded.len(), 3);
//! assert_eq!(completion.wait().await.unwrap().text, "Hello");
//! # });
//! ```

use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::model::FragmentStream;
use crate::types::{AdvisedResponse, Fragment};
use crate::PipelineError;

/// Running fold over fragments.
#[derive(Debug, Default)]
struct Accumulator {
    text: String,
    raw: Option<Value>,
    context: HashMap<String, Value>,
    fragments: usize,
}

impl Accumulator {
    fn push(&mut self, fragment: &Fragment) {
        self.text.push_str(&fragment.text);
        if fragment.raw.is_some() {
            self.raw = fragment.raw.clone();
        }
        self.context
            .extend(fragment.context.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.fragments += 1;
    }

    fn finish(&mut self) -> AdvisedResponse {
        tracing::trace!(fragments = self.fragments, len = self.text.len(), "stream aggregated");
        AdvisedResponse {
            text: std::mem::take(&mut self.text),
            finished: true,
            raw: self.raw.take(),
            context: std::mem::take(&mut self.context),
        }
    }
}

/// One-shot pass-through aggregator over a fragment stream.
pub struct StreamAggregator<F> {
    on_complete: F,
}

impl<F> StreamAggregator<F>
where
    F: FnOnce(AdvisedResponse) + Send + 'static,
{
    /// Aggregator that calls `on_complete` with the assembled response.
    pub fn new(on_complete: F) -> Self {
        Self { on_complete }
    }

    /// Attach to `upstream`; consumes the aggregator.
    ///
    /// The callback runs synchronously when the terminal fragment passes,
    /// before that fragment is forwarded downstream.
    pub fn aggregate(self, upstream: FragmentStream) -> FragmentStream {
        let mut on_complete = Some(self.on_complete);
        let mut acc = Accumulator::default();

        Box::pin(upstream.map(move |item| {
            if let Ok(ref fragment) = item {
                acc.push(fragment);
                if fragment.finished {
                    if let Some(callback) = on_complete.take() {
                        callback(acc.finish());
                    }
                }
            }
            item
        }))
    }
}

/// Resolves with the aggregated response once the terminal fragment passed.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<AdvisedResponse>,
}

impl Completion {
    /// `None` if the stream failed, was dropped, or never finished.
    pub async fn wait(self) -> Option<AdvisedResponse> {
        self.rx.await.ok()
    }
}

/// Aggregate into a future instead of a callback.
///
/// The returned stream must be driven for the [`Completion`] to resolve.
pub fn with_completion(upstream: FragmentStream) -> (FragmentStream, Completion) {
    let (tx, rx) = oneshot::channel();
    let stream = StreamAggregator::new(move |response: AdvisedResponse| {
        let _ = tx.send(response);
    })
    .aggregate(upstream);
    (stream, Completion { rx })
}

/// Drain a fragment stream into one response.
///
/// Fails with the first error, or with [`PipelineError::StreamInterrupted`]
/// if the stream ends without a terminal fragment.
pub async fn collect_response(mut stream: FragmentStream) -> Result<AdvisedResponse> {
    let mut acc = Accumulator::default();
    while let Some(item) = stream.next().await {
        let fragment = item?;
        acc.push(&fragment);
        if fragment.finished {
            return Ok(acc.finish());
        }
    }
    Err(PipelineError::StreamInterrupted {
        advisor: "collect_response".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn fragments(parts: &[&str]) -> Vec<Result<Fragment>> {
        let mut items: Vec<Result<Fragment>> =
            parts.iter().map(|p| Ok(Fragment::fragment(*p))).collect();
        items.push(Ok(Fragment::terminal().with_raw(json!({"eval_count": 3}))));
        items
    }

    fn recording() -> (
        Arc<Mutex<Vec<AdvisedResponse>>>,
        impl FnOnce(AdvisedResponse) + Send + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |r: AdvisedResponse| sink.lock().unwrap().push(r))
    }

    #[tokio::test]
    async fn test_assembles_in_order_and_fires_once() {
        let (seen, callback) = recording();
        let upstream: FragmentStream = Box::pin(stream::iter(fragments(&["Hel", "lo, ", "world"])));

        let forwarded: Vec<_> = StreamAggregator::new(callback)
            .aggregate(upstream)
            .collect()
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].text, "Hello, world");
        assert!(seen[0].finished);
        assert_eq!(seen[0].raw, Some(json!({"eval_count": 3})));
        assert_eq!(forwarded.len(), 4);
    }

    #[tokio::test]
    async fn test_fragments_forwarded_unmodified() {
        let (_, callback) = recording();
        let input = fragments(&["a", "b"]);
        let expected: Vec<Fragment> = input.iter().map(|r| r.as_ref().unwrap().clone()).collect();

        let forwarded: Vec<Fragment> = StreamAggregator::new(callback)
            .aggregate(Box::pin(stream::iter(input)))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(forwarded, expected);
    }

    #[tokio::test]
    async fn test_error_before_terminal_skips_callback() {
        let (seen, callback) = recording();
        let upstream: FragmentStream = Box::pin(stream::iter(vec![
            Ok(Fragment::fragment("Hel")),
            Err(PipelineError::Other("reset".into())),
        ]));

        let forwarded: Vec<_> = StreamAggregator::new(callback)
            .aggregate(upstream)
            .collect()
            .await;
        assert!(forwarded[1].is_err());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_stream_never_completes() {
        let upstream: FragmentStream = Box::pin(
            stream::iter(vec![Ok(Fragment::fragment("Hel"))]).chain(stream::pending()),
        );
        let (mut stream, completion) = with_completion(upstream);
        assert_eq!(stream.next().await.unwrap().unwrap().text, "Hel");
        drop(stream);
        assert!(completion.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_context_merged_from_fragments() {
        let upstream: FragmentStream = Box::pin(stream::iter(vec![
            Ok(Fragment::fragment("x").with_context("first_token_ms", 12)),
            Ok(Fragment::terminal().with_context("total_ms", 80)),
        ]));
        let response = collect_response(upstream).await.unwrap();
        assert_eq!(response.text, "x");
        assert_eq!(response.context["first_token_ms"], json!(12));
        assert_eq!(response.context["total_ms"], json!(80));
    }

    #[tokio::test]
    async fn test_collect_response_requires_terminal() {
        let upstream: FragmentStream = Box::pin(stream::iter(vec![Ok(Fragment::fragment("x"))]));
        let err = collect_response(upstream).await.unwrap_err();
        assert!(matches!(err, PipelineError::StreamInterrupted { .. }));
    }
}
