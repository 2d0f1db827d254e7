use std::{
    future::Future,
    task::{Context, Poll},
    thread,
    time::Duration,
};

use futures::task::noop_waker_ref;

pub fn poll_until_ready<Fut, T>(future: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let mut future = Box::pin(future);
    let mut context = Context::from_waker(noop_waker_ref());

    loop {
        match future.as_mut().poll(&mut context) {
            Poll::Ready(result) => {
                return result;
            }
            Poll::Pending => {
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// Block on `future` with `runtime` entered, so SDK futures find their IO
/// and timer drivers even on threads the runtime did not spawn.
pub fn block_in<Fut, T>(runtime: Option<&tokio::runtime::Handle>, future: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let _guard = runtime.map(|handle| handle.enter());
    poll_until_ready(future)
}
