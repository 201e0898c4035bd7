use anyhow::Result;
use tokio_util::sync::CancellationToken;

pub enum Transition<S, R> {
    Next(S, R),
    Stay(R),
    Done(R),
}

pub trait StateMachine<Ctx, RespCtx>: Sized {
    type StepResult<'a>: Future<Output = RespCtx> + Send + 'a
    where
        Self: 'a,
        RespCtx: 'a,
        Ctx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}

/// Drives a state machine context to completion, producing the final
/// response. The cancellation token is a hook for timing out or aborting an
/// in-progress exchange (§5, §9's login-timeout open question); individual
/// contexts are free to ignore it when they have no intermediate suspension
/// point worth cancelling.
pub trait StateMachineCtx<Ctx, R> {
    fn execute(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<R>> + Send;
}
