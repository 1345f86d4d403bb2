use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use futures_util::future::BoxFuture;

use crate::error::Error;
use crate::request::RequestDescriptor;
use crate::response::Response;
use crate::util::lock_unpoisoned;

const COMPACT_THRESHOLD: usize = 3;

/// An async hook that may rewrite or reject a value flowing through the pipeline.
pub trait Interceptor<T>: Send + Sync {
    fn intercept(&self, value: T) -> BoxFuture<'static, Result<T, Error>>;
}

impl<T, F, Fut> Interceptor<T> for F
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    fn intercept(&self, value: T) -> BoxFuture<'static, Result<T, Error>> {
        Box::pin(self(value))
    }
}

/// Handle returned by [`InterceptorChain::register`], used to eject the interceptor later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterceptorId(usize);

impl InterceptorId {
    pub fn index(self) -> usize {
        self.0
    }
}

struct ChainState<T> {
    slots: Vec<Option<Arc<dyn Interceptor<T>>>>,
    ejected: usize,
}

/// Ordered interceptors for one phase of the pipeline.
///
/// Ejecting leaves an empty slot so that ids stay stable; once more than three
/// slots are empty the chain is compacted.
pub struct InterceptorChain<T> {
    state: Mutex<ChainState<T>>,
}

impl<T: Send + 'static> InterceptorChain<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                slots: Vec::new(),
                ejected: 0,
            }),
        }
    }

    pub fn register<I>(&self, interceptor: I) -> InterceptorId
    where
        I: Interceptor<T> + 'static,
    {
        let mut state = lock_unpoisoned(&self.state);
        state.slots.push(Some(Arc::new(interceptor)));
        InterceptorId(state.slots.len() - 1)
    }

    /// Removes an interceptor. Unknown or already ejected ids are ignored.
    pub fn eject(&self, id: InterceptorId) {
        let mut state = lock_unpoisoned(&self.state);
        let Some(slot) = state.slots.get_mut(id.0) else {
            return;
        };
        if slot.take().is_none() {
            return;
        }
        state.ejected += 1;
        if state.ejected > COMPACT_THRESHOLD {
            compact_state(&mut state);
        }
    }

    /// Number of live interceptors.
    pub fn len(&self) -> usize {
        let state = lock_unpoisoned(&self.state);
        state.slots.len() - state.ejected
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops empty slots. Ids handed out before compaction no longer refer to
    /// the same interceptor.
    pub fn compact(&self) {
        compact_state(&mut lock_unpoisoned(&self.state));
    }

    pub fn clear(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.slots.clear();
        state.ejected = 0;
    }

    fn snapshot(&self) -> Vec<Arc<dyn Interceptor<T>>> {
        lock_unpoisoned(&self.state)
            .slots
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Runs every live interceptor in registration order; the first error wins.
    pub(crate) async fn run(&self, mut value: T) -> Result<T, Error> {
        for interceptor in self.snapshot() {
            value = interceptor.intercept(value).await?;
        }
        Ok(value)
    }
}

fn compact_state<T>(state: &mut ChainState<T>) {
    state.slots.retain(Option::is_some);
    state.ejected = 0;
}

impl<T: Send + 'static> Default for InterceptorChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for InterceptorChain<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.state);
        formatter
            .debug_struct("InterceptorChain")
            .field("slots", &state.slots.len())
            .field("ejected", &state.ejected)
            .finish()
    }
}

/// Request and response interceptor chains.
#[derive(Debug, Default)]
pub struct Interceptors {
    pub request: InterceptorChain<RequestDescriptor>,
    pub response: InterceptorChain<Response>,
}

static GLOBAL_INTERCEPTORS: OnceLock<Arc<Interceptors>> = OnceLock::new();

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interceptors shared by every request sent through the global client.
    pub fn global() -> Arc<Self> {
        GLOBAL_INTERCEPTORS
            .get_or_init(|| Arc::new(Self::new()))
            .clone()
    }

    pub fn clear(&self) {
        self.request.clear();
        self.response.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(amount: i32) -> impl Fn(i32) -> std::future::Ready<Result<i32, Error>> + Send + Sync {
        move |value| std::future::ready(Ok(value + amount))
    }

    #[tokio::test]
    async fn interceptors_run_in_registration_order() {
        let chain = InterceptorChain::<i32>::new();
        chain.register(add(1));
        chain.register(|value: i32| async move { Ok::<_, Error>(value * 10) });
        assert_eq!(chain.run(1).await.expect("run"), 20);
    }

    #[tokio::test]
    async fn ejected_interceptors_are_skipped() {
        let chain = InterceptorChain::<i32>::new();
        let first = chain.register(add(1));
        chain.register(add(2));
        chain.eject(first);
        chain.eject(first);
        chain.eject(InterceptorId(99));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.run(0).await.expect("run"), 2);
    }

    #[tokio::test]
    async fn first_failure_aborts_the_chain() {
        let chain = InterceptorChain::<i32>::new();
        chain.register(|_value: i32| async move {
            Err::<i32, Error>(Error::interceptor("rejected"))
        });
        chain.register(add(1));
        let error = chain.run(0).await.expect_err("should fail");
        assert!(matches!(error, Error::Interceptor { .. }));
    }

    #[test]
    fn chain_compacts_after_more_than_three_ejections() {
        let chain = InterceptorChain::<i32>::new();
        let ids = (0..5).map(|step| chain.register(add(step))).collect::<Vec<_>>();
        for id in &ids[..3] {
            chain.eject(*id);
        }
        assert_eq!(lock_unpoisoned(&chain.state).slots.len(), 5);
        chain.eject(ids[3]);
        let state = lock_unpoisoned(&chain.state);
        assert_eq!(state.slots.len(), 1);
        assert_eq!(state.ejected, 0);
    }

    #[test]
    fn clear_removes_everything() {
        let chain = InterceptorChain::<i32>::new();
        chain.register(add(1));
        chain.clear();
        assert!(chain.is_empty());
    }
}
