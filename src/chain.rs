//! # Advisor chain
//!
//! [`AdvisorChain`] runs an ordered list of advisors around a terminal
//! [`ChatModel`]. Advisors are sorted ascending by [`order`](crate::advisor::Advisor::order)
//! (stable, so ties keep registration order) and nested like an onion:
//!
//! ```text
//!   request ──► a1 ──► a2 ──► … ──► an ──► model
//!   response ◄── a1 ◄── a2 ◄── … ◄── an ◄──┘
//! ```
//!
//! The chain is immutable after [`ChainBuilder::build`] and holds no
//! per-invocation state, so one instance can serve concurrent callers.
//! It never retries, caches, or deduplicates.
//!
//! ## Error attribution
//!
//! An error that comes out of a continuation passes through every outer
//! advisor unchanged. An error an advisor produces itself is wrapped once in
//! [`PipelineError::AdvisorFailed`], tagged [`Phase::Before`] if the advisor
//! had not yet invoked its continuation and [`Phase::After`] otherwise.
//! Contract breaches are reported as [`PipelineError::ProtocolViolation`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::advisor::{CallAdvisor, RegisteredAdvisor, StreamAdvisor};
use crate::error::{Phase, Result};
use crate::model::{ChatModel, FragmentStream};
use crate::types::{AdvisedRequest, AdvisedResponse, Fragment};
use crate::PipelineError;

/// Bookkeeping for one advisor hop of one invocation.
#[derive(Debug, Default)]
struct HopState {
    calls: AtomicUsize,
    downstream_failed: AtomicBool,
}

impl HopState {
    fn enter(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn mark_failed(&self) {
        self.downstream_failed.store(true, Ordering::SeqCst);
    }

    fn downstream_failed(&self) -> bool {
        self.downstream_failed.load(Ordering::SeqCst)
    }
}

/// Attribute an error surfacing from a hop.
fn attribute(err: PipelineError, advisor: &str, state: Option<&HopState>) -> PipelineError {
    match state {
        None => err,
        Some(st) if st.downstream_failed() => err,
        Some(st) => PipelineError::AdvisorFailed {
            advisor: advisor.to_string(),
            phase: if st.calls() == 0 {
                Phase::Before
            } else {
                Phase::After
            },
            source: Box::new(err),
        },
    }
}

/// The rest of a unary chain, as seen by one advisor.
pub struct CallNext {
    advisors: Arc<[Arc<dyn CallAdvisor>]>,
    index: usize,
    model: Arc<dyn ChatModel>,
    caller: String,
    state: Arc<HopState>,
}

impl CallNext {
    /// Invoke the remaining advisors and the model. Call at most once.
    pub async fn call(&self, request: AdvisedRequest) -> Result<AdvisedResponse> {
        let n = self.state.enter();
        if n > 1 {
            self.state.mark_failed();
            return Err(PipelineError::violation(
                &self.caller,
                Phase::After,
                format!("continuation invoked {} times", n),
            ));
        }
        let result = run_call(self.advisors.clone(), self.index, self.model.clone(), request).await;
        if result.is_err() {
            self.state.mark_failed();
        }
        result
    }
}

/// The rest of a streaming chain, as seen by one advisor.
pub struct StreamNext {
    advisors: Arc<[Arc<dyn StreamAdvisor>]>,
    index: usize,
    model: Arc<dyn ChatModel>,
    caller: String,
    state: Arc<HopState>,
}

impl StreamNext {
    /// Subscribe to the remaining advisors and the model. Subscribe at most once.
    pub fn stream(&self, request: AdvisedRequest) -> FragmentStream {
        let n = self.state.enter();
        if n > 1 {
            self.state.mark_failed();
            let err = PipelineError::violation(
                &self.caller,
                Phase::After,
                format!("continuation subscribed {} times", n),
            );
            return Box::pin(futures::stream::once(async move { Err(err) }));
        }
        let state = self.state.clone();
        let inner = run_stream(self.advisors.clone(), self.index, self.model.clone(), request);
        Box::pin(inner.inspect(move |item| {
            if item.is_err() {
                state.mark_failed();
            }
        }))
    }
}

fn run_call(
    advisors: Arc<[Arc<dyn CallAdvisor>]>,
    index: usize,
    model: Arc<dyn ChatModel>,
    request: AdvisedRequest,
) -> BoxFuture<'static, Result<AdvisedResponse>> {
    async move {
        let Some(advisor) = advisors.get(index).cloned() else {
            let response = model.call(&request).await?;
            if !response.finished {
                return Err(PipelineError::violation(
                    model.name(),
                    Phase::Model,
                    "model returned an unfinished response",
                ));
            }
            return Ok(response);
        };

        let name = advisor.name().to_string();
        let state = Arc::new(HopState::default());
        let next = CallNext {
            advisors: advisors.clone(),
            index: index + 1,
            model,
            caller: name.clone(),
            state: state.clone(),
        };

        tracing::debug!(advisor = %name, order = advisor.order(), depth = index, "advisor call enter");
        let result = advisor.around_call(request, next).await;
        let calls = state.calls();
        tracing::debug!(advisor = %name, calls, ok = result.is_ok(), "advisor call exit");

        if calls > 1 {
            return Err(PipelineError::violation(
                name,
                Phase::After,
                format!("continuation invoked {} times", calls),
            ));
        }
        match result {
            Ok(response) if !response.finished => Err(PipelineError::violation(
                name,
                Phase::After,
                "returned an unfinished response from a unary call",
            )),
            Ok(response) => Ok(response),
            Err(e) => Err(attribute(e, &name, Some(&state))),
        }
    }
    .boxed()
}

fn run_stream(
    advisors: Arc<[Arc<dyn StreamAdvisor>]>,
    index: usize,
    model: Arc<dyn ChatModel>,
    request: AdvisedRequest,
) -> FragmentStream {
    let Some(advisor) = advisors.get(index).cloned() else {
        let name = model.name().to_string();
        return guard(model.stream(request), name, None);
    };

    let name = advisor.name().to_string();
    let state = Arc::new(HopState::default());
    let next = StreamNext {
        advisors: advisors.clone(),
        index: index + 1,
        model,
        caller: name.clone(),
        state: state.clone(),
    };

    tracing::debug!(advisor = %name, order = advisor.order(), depth = index, "advisor stream assembled");
    let inner = advisor.around_stream(request, next);
    guard(inner, name, Some(state))
}

/// Enforce the fragment contract on one hop's output.
///
/// `state` is `None` for the terminal model.
fn guard(inner: FragmentStream, hop: String, state: Option<Arc<HopState>>) -> FragmentStream {
    let phase = if state.is_some() {
        Phase::After
    } else {
        Phase::Model
    };

    Box::pin(async_stream::stream! {
        let mut inner = inner;
        let mut finished = false;

        while let Some(item) = inner.next().await {
            let calls = state.as_ref().map_or(0, |st| st.calls());
            if calls > 1 {
                let err: Result<Fragment> = Err(PipelineError::violation(
                    &hop,
                    Phase::After,
                    format!("continuation subscribed {} times", calls),
                ));
                yield err;
                return;
            }
            match item {
                Err(e) => {
                    let err: Result<Fragment> = Err(attribute(e, &hop, state.as_deref()));
                    yield err;
                    return;
                }
                Ok(_) if finished => {
                    let err: Result<Fragment> = Err(PipelineError::violation(
                        &hop,
                        phase,
                        "fragment emitted after the terminal fragment",
                    ));
                    yield err;
                    return;
                }
                Ok(fragment) => {
                    finished = fragment.finished;
                    yield Ok(fragment);
                }
            }
        }

        if !finished {
            tracing::debug!(hop = %hop, "stream ended without terminal fragment");
            let err: Result<Fragment> = Err(PipelineError::StreamInterrupted { advisor: hop });
            yield err;
        }
    })
}

/// An ordered advisor chain around a terminal model.
///
/// # Example
///
/// ```no_run
/// use advisor_pipeline::advisor::{LoggingAdvisor, ReReadingAdvisor, RegisteredAdvisor};
/// use advisor_pipeline::chain::AdvisorChain;
/// use advisor_pipeline::model::BackendModel;
/// use advisor_pipeline::AdvisedRequest;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let model = BackendModel::builder("http://localhost:11434")
///         .model("llama3.2:3b")
///         .build()?;
///     let chain = AdvisorChain::builder(Arc::new(model))
///         .advisor(RegisteredAdvisor::both(LoggingAdvisor::new()))
///         .advisor(RegisteredAdvisor::both(ReReadingAdvisor::new()))
///         .build()?;
///
///     let response = chain.call(AdvisedRequest::new("What is 17 * 23?")).await?;
///     println!("{}", response.text);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct AdvisorChain {
    model: Arc<dyn ChatModel>,
    registered: Vec<RegisteredAdvisor>,
    call_advisors: Arc<[Arc<dyn CallAdvisor>]>,
    stream_advisors: Arc<[Arc<dyn StreamAdvisor>]>,
}

impl AdvisorChain {
    pub fn builder(model: Arc<dyn ChatModel>) -> ChainBuilder {
        ChainBuilder {
            model,
            advisors: Vec::new(),
        }
    }

    /// Registered advisors in effective (sorted) order.
    pub fn advisors(&self) -> &[RegisteredAdvisor] {
        &self.registered
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    /// A builder seeded with this chain's model and advisors.
    pub fn to_builder(&self) -> ChainBuilder {
        ChainBuilder {
            model: self.model.clone(),
            advisors: self.registered.clone(),
        }
    }

    /// Run a unary invocation through every call-capable advisor.
    pub async fn call(&self, request: AdvisedRequest) -> Result<AdvisedResponse> {
        run_call(self.call_advisors.clone(), 0, self.model.clone(), request).await
    }

    /// Run a streaming invocation through every stream-capable advisor.
    ///
    /// Advisor request-side hooks run now; the model is contacted when the
    /// returned stream is first polled.
    pub fn stream(&self, request: AdvisedRequest) -> FragmentStream {
        run_stream(self.stream_advisors.clone(), 0, self.model.clone(), request)
    }

    /// Like [`call`](Self::call), abandoning the invocation when `token` fires.
    pub async fn call_cancellable(
        &self,
        request: AdvisedRequest,
        token: CancellationToken,
    ) -> Result<AdvisedResponse> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("unary invocation cancelled");
                Err(PipelineError::Cancelled)
            }
            result = self.call(request) => result,
        }
    }

    /// Like [`stream`](Self::stream), stopping promptly when `token` fires.
    ///
    /// On cancellation the upstream stream is dropped, a single
    /// [`PipelineError::Cancelled`] is yielded, and the stream ends.
    pub fn stream_cancellable(
        &self,
        request: AdvisedRequest,
        token: CancellationToken,
    ) -> FragmentStream {
        let mut inner = self.stream(request);
        Box::pin(async_stream::stream! {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    item = inner.next() => Some(item),
                };
                match item {
                    None => {
                        tracing::debug!("streaming invocation cancelled");
                        drop(inner);
                        let err: Result<Fragment> = Err(PipelineError::Cancelled);
                        yield err;
                        return;
                    }
                    Some(None) => return,
                    Some(Some(item)) => yield item,
                }
            }
        })
    }
}

impl std::fmt::Debug for AdvisorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisorChain")
            .field("model", &self.model.name())
            .field("advisors", &self.registered)
            .finish()
    }
}

/// Builder for [`AdvisorChain`].
pub struct ChainBuilder {
    model: Arc<dyn ChatModel>,
    advisors: Vec<RegisteredAdvisor>,
}

impl ChainBuilder {
    /// Register an advisor.
    pub fn advisor(mut self, advisor: RegisteredAdvisor) -> Self {
        self.advisors.push(advisor);
        self
    }

    /// Register several advisors, in iteration order.
    pub fn advisors(mut self, advisors: impl IntoIterator<Item = RegisteredAdvisor>) -> Self {
        self.advisors.extend(advisors);
        self
    }

    /// Sort and freeze the chain. Fails on duplicate advisor names.
    pub fn build(mut self) -> Result<AdvisorChain> {
        for (i, a) in self.advisors.iter().enumerate() {
            if self.advisors[..i].iter().any(|b| b.name() == a.name()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate advisor name '{}'",
                    a.name()
                )));
            }
        }

        self.advisors.sort_by_key(|a| a.order());

        let call_advisors: Vec<_> = self.advisors.iter().filter_map(|a| a.as_call()).collect();
        let stream_advisors: Vec<_> = self.advisors.iter().filter_map(|a| a.as_stream()).collect();

        tracing::debug!(
            model = %self.model.name(),
            advisors = ?self.advisors.iter().map(|a| a.name()).collect::<Vec<_>>(),
            "advisor chain built"
        );

        Ok(AdvisorChain {
            model: self.model,
            registered: self.advisors,
            call_advisors: call_advisors.into(),
            stream_advisors: stream_advisors.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::Advisor;
    use crate::aggregator::StreamAggregator;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;

    struct ScriptedModel {
        fragments: Vec<&'static str>,
        terminal: bool,
        hang: bool,
        calls: AtomicUsize,
        streams: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(fragments: Vec<&'static str>) -> Self {
            Self {
                fragments,
                terminal: true,
                hang: false,
                calls: AtomicUsize::new(0),
                streams: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn call(&self, request: &AdvisedRequest) -> Result<AdvisedResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AdvisedResponse::complete(format!(
                "echo: {}",
                request.rendered_user_text()
            )))
        }

        fn stream(&self, _request: AdvisedRequest) -> FragmentStream {
            self.streams.fetch_add(1, Ordering::SeqCst);
            let mut items: Vec<Result<Fragment>> = self
                .fragments
                .iter()
                .map(|t| Ok(Fragment::fragment(*t)))
                .collect();
            if self.terminal {
                items.push(Ok(Fragment::terminal()));
            }
            if self.hang {
                Box::pin(stream::iter(items).chain(stream::pending()))
            } else {
                Box::pin(stream::iter(items))
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        async fn call(&self, _request: &AdvisedRequest) -> Result<AdvisedResponse> {
            Err(PipelineError::HttpError {
                status: 503,
                body: "overloaded".into(),
                retry_after: None,
            })
        }

        fn stream(&self, _request: AdvisedRequest) -> FragmentStream {
            Box::pin(stream::iter(vec![
                Ok(Fragment::fragment("partial")),
                Err(PipelineError::Other("connection reset".into())),
            ]))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    /// Records pre/post hook firing as `pre:<order>` / `post:<order>`.
    struct Recorder {
        name: String,
        order: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &str, order: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                order,
                log: log.clone(),
            }
        }
    }

    impl Advisor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn order(&self) -> i32 {
            self.order
        }
    }

    #[async_trait]
    impl CallAdvisor for Recorder {
        async fn around_call(
            &self,
            request: AdvisedRequest,
            next: CallNext,
        ) -> Result<AdvisedResponse> {
            self.log.lock().unwrap().push(format!("pre:{}", self.name));
            let response = next.call(request).await?;
            self.log.lock().unwrap().push(format!("post:{}", self.name));
            Ok(response)
        }
    }

    impl StreamAdvisor for Recorder {
        fn around_stream(&self, request: AdvisedRequest, next: StreamNext) -> FragmentStream {
            self.log.lock().unwrap().push(format!("pre:{}", self.name));
            let log = self.log.clone();
            let name = self.name.clone();
            Box::pin(next.stream(request).inspect(move |item| {
                if matches!(item, Ok(f) if f.finished) {
                    log.lock().unwrap().push(format!("post:{}", name));
                }
            }))
        }
    }

    /// Unary advisor with scripted misbehavior.
    enum Rogue {
        CallsTwice,
        ShortCircuit(&'static str),
        Unfinished,
        FailsBefore,
        FailsAfter,
    }

    impl Advisor for Rogue {
        fn name(&self) -> &str {
            "rogue"
        }
    }

    #[async_trait]
    impl CallAdvisor for Rogue {
        async fn around_call(
            &self,
            request: AdvisedRequest,
            next: CallNext,
        ) -> Result<AdvisedResponse> {
            match self {
                Rogue::CallsTwice => {
                    let _ = next.call(request.clone()).await?;
                    next.call(request).await
                }
                Rogue::ShortCircuit(text) => Ok(AdvisedResponse::complete(*text)),
                Rogue::Unfinished => Ok(AdvisedResponse::fragment("half")),
                Rogue::FailsBefore => Err(PipelineError::Other("bad input".into())),
                Rogue::FailsAfter => {
                    next.call(request).await?;
                    Err(PipelineError::Other("audit write failed".into()))
                }
            }
        }
    }

    /// Streaming advisor with scripted misbehavior.
    enum RogueStream {
        SubscribesTwice,
        AfterTerminal,
        DropsTerminal,
    }

    impl Advisor for RogueStream {
        fn name(&self) -> &str {
            "rogue-stream"
        }
    }

    impl StreamAdvisor for RogueStream {
        fn around_stream(&self, request: AdvisedRequest, next: StreamNext) -> FragmentStream {
            match self {
                RogueStream::SubscribesTwice => {
                    let first = next.stream(request.clone());
                    let second = next.stream(request);
                    Box::pin(first.chain(second))
                }
                RogueStream::AfterTerminal => Box::pin(
                    next.stream(request)
                        .chain(stream::iter(vec![Ok(Fragment::fragment("extra"))])),
                ),
                RogueStream::DropsTerminal => Box::pin(
                    next.stream(request)
                        .filter(|item| futures::future::ready(!matches!(item, Ok(f) if f.finished))),
                ),
            }
        }
    }

    fn recorders(log: &Arc<Mutex<Vec<String>>>) -> Vec<RegisteredAdvisor> {
        vec![
            RegisteredAdvisor::both(Recorder::new("2", 2, log)),
            RegisteredAdvisor::both(Recorder::new("0", 0, log)),
            RegisteredAdvisor::both(Recorder::new("1", 1, log)),
        ]
    }

    fn chain_with(model: Arc<dyn ChatModel>, advisors: Vec<RegisteredAdvisor>) -> AdvisorChain {
        AdvisorChain::builder(model).advisors(advisors).build().unwrap()
    }

    async fn collect(stream: FragmentStream) -> Vec<Result<Fragment>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_call_hooks_nest_like_an_onion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(Arc::new(ScriptedModel::new(vec![])), recorders(&log));

        let response = chain.call(AdvisedRequest::new("hi")).await.unwrap();
        assert_eq!(response.text, "echo: hi");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["pre:0", "pre:1", "pre:2", "post:2", "post:1", "post:0"]
        );
    }

    #[tokio::test]
    async fn test_stream_hooks_nest_like_an_onion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(Arc::new(ScriptedModel::new(vec!["a", "b"])), recorders(&log));

        let items = collect(chain.stream(AdvisedRequest::new("hi"))).await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.is_ok()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["pre:0", "pre:1", "pre:2", "post:2", "post:1", "post:0"]
        );
    }

    #[tokio::test]
    async fn test_equal_order_keeps_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec![])),
            vec![
                RegisteredAdvisor::call(Recorder::new("first", 5, &log)),
                RegisteredAdvisor::call(Recorder::new("second", 5, &log)),
                RegisteredAdvisor::call(Recorder::new("early", -1, &log)),
            ],
        );
        let names: Vec<&str> = chain.advisors().iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["early", "first", "second"]);

        chain.call(AdvisedRequest::new("hi")).await.unwrap();
        assert_eq!(log.lock().unwrap()[..3], ["pre:early", "pre:first", "pre:second"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = AdvisorChain::builder(Arc::new(ScriptedModel::new(vec![])))
            .advisor(RegisteredAdvisor::call(Recorder::new("dup", 0, &log)))
            .advisor(RegisteredAdvisor::stream(Recorder::new("dup", 1, &log)))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(ref m) if m.contains("dup")));
    }

    #[tokio::test]
    async fn test_advisors_only_join_supported_modes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec!["x"])),
            vec![
                RegisteredAdvisor::call(Recorder::new("unary", 0, &log)),
                RegisteredAdvisor::stream(Recorder::new("streaming", 1, &log)),
            ],
        );

        chain.call(AdvisedRequest::new("hi")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["pre:unary", "post:unary"]);

        log.lock().unwrap().clear();
        collect(chain.stream(AdvisedRequest::new("hi"))).await;
        assert_eq!(*log.lock().unwrap(), vec!["pre:streaming", "post:streaming"]);
    }

    #[tokio::test]
    async fn test_double_continuation_is_protocol_violation() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let chain = chain_with(model.clone(), vec![RegisteredAdvisor::call(Rogue::CallsTwice)]);

        let err = chain.call(AdvisedRequest::new("hi")).await.unwrap_err();
        assert!(err.is_protocol_violation(), "got {:?}", err);
        assert_eq!(err.advisor(), Some("rogue"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outer_advisor_sees_inner_violation_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec![])),
            vec![
                RegisteredAdvisor::call(Recorder::new("outer", 0, &log)),
                RegisteredAdvisor::call(Rogue::CallsTwice),
            ],
        );
        let err = chain.call(AdvisedRequest::new("hi")).await.unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(err.advisor(), Some("rogue"));
        assert_eq!(*log.lock().unwrap(), vec!["pre:outer"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_model() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(
            model.clone(),
            vec![
                RegisteredAdvisor::call(Recorder::new("outer", 0, &log)),
                RegisteredAdvisor::call(Rogue::ShortCircuit("cached")),
            ],
        );
        let response = chain.call(AdvisedRequest::new("hi")).await.unwrap();
        assert_eq!(response.text, "cached");
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock().unwrap(), vec!["pre:outer", "post:outer"]);
    }

    #[tokio::test]
    async fn test_unfinished_unary_response_is_violation() {
        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec![])),
            vec![RegisteredAdvisor::call(Rogue::Unfinished)],
        );
        let err = chain.call(AdvisedRequest::new("hi")).await.unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_model_error_passes_through_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(Arc::new(FailingModel), recorders(&log));

        let err = chain.call(AdvisedRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, PipelineError::HttpError { status: 503, .. }));
        assert_eq!(*log.lock().unwrap(), vec!["pre:0", "pre:1", "pre:2"]);
    }

    #[tokio::test]
    async fn test_advisor_failure_names_phase() {
        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec![])),
            vec![RegisteredAdvisor::call(Rogue::FailsBefore)],
        );
        let err = chain.call(AdvisedRequest::new("hi")).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::AdvisorFailed { ref advisor, phase: Phase::Before, .. } if advisor == "rogue"
        ));

        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec![])),
            vec![RegisteredAdvisor::call(Rogue::FailsAfter)],
        );
        let err = chain.call(AdvisedRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, PipelineError::AdvisorFailed { phase: Phase::After, .. }));
    }

    #[tokio::test]
    async fn test_stream_double_subscription_is_violation() {
        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec!["a"])),
            vec![RegisteredAdvisor::stream(RogueStream::SubscribesTwice)],
        );
        let items = collect(chain.stream(AdvisedRequest::new("hi"))).await;
        let last = items.last().unwrap();
        assert!(matches!(last, Err(e) if e.is_protocol_violation()));
        assert!(items.iter().filter(|i| i.is_err()).count() == 1);
    }

    #[tokio::test]
    async fn test_fragment_after_terminal_is_violation() {
        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec!["a"])),
            vec![RegisteredAdvisor::stream(RogueStream::AfterTerminal)],
        );
        let items = collect(chain.stream(AdvisedRequest::new("hi"))).await;
        assert_eq!(items.len(), 3);
        assert!(items[1].as_ref().unwrap().finished);
        assert!(matches!(&items[2], Err(e) if e.is_protocol_violation()));
    }

    #[tokio::test]
    async fn test_missing_terminal_is_stream_interrupted() {
        let mut model = ScriptedModel::new(vec!["a", "b"]);
        model.terminal = false;
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(Arc::new(model), recorders(&log));

        let items = collect(chain.stream(AdvisedRequest::new("hi"))).await;
        assert_eq!(items.len(), 3);
        match &items[2] {
            Err(PipelineError::StreamInterrupted { advisor }) => assert_eq!(advisor, "scripted"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!log.lock().unwrap().iter().any(|e| e.starts_with("post")));
    }

    #[tokio::test]
    async fn test_advisor_dropping_terminal_is_named() {
        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec!["a"])),
            vec![RegisteredAdvisor::stream(RogueStream::DropsTerminal)],
        );
        let items = collect(chain.stream(AdvisedRequest::new("hi"))).await;
        assert!(matches!(
            items.last(),
            Some(Err(PipelineError::StreamInterrupted { advisor })) if advisor == "rogue-stream"
        ));
    }

    #[tokio::test]
    async fn test_stream_error_ends_stream_and_passes_through() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(Arc::new(FailingModel), recorders(&log));
        let items = collect(chain.stream(AdvisedRequest::new("hi"))).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(PipelineError::Other(m)) if m == "connection reset"));
    }

    #[tokio::test]
    async fn test_concurrent_invocations_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(Arc::new(ScriptedModel::new(vec![])), recorders(&log));

        let (a, b) = tokio::join!(
            chain.call(AdvisedRequest::new("one")),
            chain.call(AdvisedRequest::new("two")),
        );
        assert_eq!(a.unwrap().text, "echo: one");
        assert_eq!(b.unwrap().text, "echo: two");
    }

    #[tokio::test]
    async fn test_call_cancellable_pre_cancelled() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let chain = chain_with(model.clone(), vec![]);
        let token = CancellationToken::new();
        token.cancel();

        let err = chain
            .call_cancellable(AdvisedRequest::new("hi"), token)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    struct HangingModel {
        entered: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ChatModel for HangingModel {
        async fn call(&self, _request: &AdvisedRequest) -> Result<AdvisedResponse> {
            self.entered.notify_one();
            futures::future::pending().await
        }

        fn stream(&self, _request: AdvisedRequest) -> FragmentStream {
            Box::pin(stream::pending())
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn test_call_cancelled_while_model_in_flight() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(
            Arc::new(HangingModel { entered: entered.clone() }),
            recorders(&log),
        );
        let token = CancellationToken::new();

        let pending = tokio::spawn({
            let chain = chain.clone();
            let token = token.clone();
            async move { chain.call_cancellable(AdvisedRequest::new("hi"), token).await }
        });
        entered.notified().await;
        token.cancel();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(*log.lock().unwrap(), vec!["pre:0", "pre:1", "pre:2"]);
    }

    /// Aggregates the stream and records completion.
    struct Completion {
        done: Arc<Mutex<Vec<String>>>,
    }

    impl Advisor for Completion {
        fn name(&self) -> &str {
            "completion"
        }
    }

    impl StreamAdvisor for Completion {
        fn around_stream(&self, request: AdvisedRequest, next: StreamNext) -> FragmentStream {
            let done = self.done.clone();
            StreamAggregator::new(move |response: AdvisedResponse| {
                done.lock().unwrap().push(response.text);
            })
            .aggregate(next.stream(request))
        }
    }

    #[tokio::test]
    async fn test_stream_cancellation_skips_aggregation_callback() {
        let done = Arc::new(Mutex::new(Vec::new()));
        let mut model = ScriptedModel::new(vec!["Hel", "lo"]);
        model.hang = true;
        model.terminal = false;
        let chain = chain_with(
            Arc::new(model),
            vec![RegisteredAdvisor::stream(Completion { done: done.clone() })],
        );

        let token = CancellationToken::new();
        let mut stream = chain.stream_cancellable(AdvisedRequest::new("hi"), token.clone());
        assert_eq!(stream.next().await.unwrap().unwrap().text, "Hel");
        assert_eq!(stream.next().await.unwrap().unwrap().text, "lo");

        token.cancel();
        assert!(matches!(stream.next().await, Some(Err(PipelineError::Cancelled))));
        assert!(stream.next().await.is_none());
        assert!(done.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_cancellable_completes_normally() {
        let done = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_with(
            Arc::new(ScriptedModel::new(vec!["Hel", "lo, ", "world"])),
            vec![RegisteredAdvisor::stream(Completion { done: done.clone() })],
        );
        let items = collect(chain.stream_cancellable(AdvisedRequest::new("hi"), CancellationToken::new())).await;
        assert_eq!(items.len(), 4);
        assert_eq!(*done.lock().unwrap(), vec!["Hello, world".to_string()]);
    }
}
