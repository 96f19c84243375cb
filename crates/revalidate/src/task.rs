use std::sync::Arc;
use std::time::Instant;

use crate::error::ResolveResult;
use crate::function::{AsyncFunction, Context, Resolver};
use crate::holder::ResponseHolder;
use crate::key::RequestKey;
use crate::utils::defer;

/// One background execution of the wrapped computation.
///
/// The task owns everything it needs (a clone of the function, the input,
/// the per-call context and the holder), so it outlives the caller that
/// spawned it, including callers whose bounded wait has already elapsed.
pub(crate) struct BackgroundTask<R: Resolver> {
    pub(crate) function: AsyncFunction<R>,
    pub(crate) key: RequestKey,
    pub(crate) input: R::Input,
    pub(crate) context: Option<Context>,
    pub(crate) holder: Arc<ResponseHolder<R::Output>>,
}

impl<R: Resolver> BackgroundTask<R> {
    pub(crate) async fn run(self) -> ResolveResult<R::Output> {
        let BackgroundTask {
            function,
            key,
            input,
            context,
            holder,
        } = self;

        // The claim token is released last, on every exit path, including
        // cancellation of this task.
        let claim = Arc::clone(&holder);
        let _claim = defer(move || claim.clear_pending());

        if let Some(hook) = &function.on_before {
            hook(&input, context.as_ref());
        }

        metric!(counter("requests.computation") += 1, "function" => &function.name);
        let started = Instant::now();
        let outcome = function.resolver.resolve(&input).await;
        metric!(timer("resolve.duration") = started.elapsed(), "function" => &function.name);

        match outcome {
            Ok(value) => {
                holder.store_result(value.clone());
                holder.finish_first_request();
                Ok(value)
            }
            Err(error) => {
                // Materialize the default eagerly so the waiter and later
                // callers find it already cached.
                function.cache_default(&holder);
                if error.is_soft() {
                    metric!(counter("requests.soft_failure") += 1, "function" => &function.name);
                    tracing::warn!(
                        function = &*function.name,
                        key = %key,
                        error = %error,
                        "computation failed with a soft error"
                    );
                } else if function.substitutes_failures() {
                    metric!(counter("requests.failure") += 1, "function" => &function.name);
                    tracing::warn!(
                        function = &*function.name,
                        key = %key,
                        error = %error,
                        "computation failed"
                    );
                }
                Err(error)
            }
        }
    }
}
