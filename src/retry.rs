//! Retry combinator for fallible system calls.

use std::io;

/// Run `op` until it succeeds or fails with an error `should_retry` rejects.
pub fn retry_while<T, E, F, P>(mut op: F, should_retry: P) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
{
    loop {
        match op() {
            Err(err) if should_retry(&err) => {}
            result => return result,
        }
    }
}

/// Retry predicate for `EINTR`.
pub fn is_interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}
