//! Task-local request-origin scoping: lets a sink tag an event with the
//! surface that produced it (e.g. `"router"` vs `"admin"`) without
//! threading an extra parameter through every call site.

use std::cell::RefCell;
use std::future::Future;

tokio::task_local! {
    static REQUEST_ORIGIN: RefCell<Option<String>>;
}

pub async fn with_request_origin<F, Fut, T>(origin: impl Into<String>, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let origin = origin.into();
    REQUEST_ORIGIN
        .scope(RefCell::new(Some(origin)), async move { f().await })
        .await
}

pub fn current_request_origin() -> Option<String> {
    REQUEST_ORIGIN.try_with(|cell| cell.borrow().clone()).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scopes_override_and_restore() {
        assert!(current_request_origin().is_none());
        with_request_origin("outer", || async {
            assert_eq!(current_request_origin().as_deref(), Some("outer"));
            with_request_origin("inner", || async {
                assert_eq!(current_request_origin().as_deref(), Some("inner"));
            })
            .await;
            assert_eq!(current_request_origin().as_deref(), Some("outer"));
        })
        .await;
        assert!(current_request_origin().is_none());
    }
}
