#![deny(missing_docs)]
//! Test utilities for the blockswarm request scheduler.

pub mod id;
pub mod request;

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

/// Generate `len` random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut out = vec![0; len];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Repeatedly run a code block until it `break`s, sleeping between
/// iterations, and panic if that does not happen within the timeout.
///
/// The calling crate must depend on tokio with the `time` feature.
///
/// - `iter_check!({ ... })`: 1000 ms timeout, 1 ms sleep.
/// - `iter_check!(timeout_ms, { ... })`: 1 ms sleep.
/// - `iter_check!(timeout_ms, sleep_ms, { ... })`.
#[macro_export]
macro_rules! iter_check {
    ({ $($code:tt)* }) => {
        $crate::iter_check!(1000, 1, { $($code)* })
    };

    ($timeout_ms:expr, { $($code:tt)* }) => {
        $crate::iter_check!($timeout_ms, 1, { $($code)* })
    };

    ($timeout_ms:expr, $sleep_ms:expr, { $($code:tt)* }) => {
        tokio::time::timeout(
            std::time::Duration::from_millis($timeout_ms),
            async {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        $sleep_ms,
                    ))
                    .await;
                    $($code)*
                }
            },
        )
        .await
        .unwrap();
    };
}

#[cfg(test)]
mod test {
    #[tokio::test]
    async fn iter_check_accepts_every_form() {
        let mut n = 0;
        iter_check!({
            n += 1;
            if n == 2 {
                break;
            }
        });
        iter_check!(500, {
            n += 1;
            if n == 4 {
                break;
            }
        });
        iter_check!(500, 2, {
            n += 1;
            if n == 6 {
                break;
            }
        });
        assert_eq!(6, n);
    }
}
