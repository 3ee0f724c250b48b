//! Blockswarm error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The core blockswarm error type.
///
/// This is the error returned by administrative calls (registration,
/// configuration, job queueing). The outcome of an individual block
/// operation is reported through [crate::RequestError] instead.
///
/// This type is required to implement `Clone` so that a single failed
/// registration can be reported to every getter of a group.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SwarmError {
    /// Generic blockswarm internal error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },
}

impl SwarmError {
    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }
}

/// The core blockswarm result type.
pub type SwarmResult<T> = Result<T, SwarmError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            "bla (src: None)",
            SwarmError::other("bla").to_string().as_str(),
        );
        assert_eq!(
            "foo (src: bar)",
            SwarmError::other_src("foo", std::io::Error::other("bar"))
                .to_string()
                .as_str(),
        );
    }

    #[test]
    fn error_source_is_reachable() {
        use std::error::Error;

        let err = SwarmError::other_src(
            "queue closed",
            std::io::Error::other("receiver dropped"),
        );
        let src = err.source().unwrap().source().unwrap();
        assert_eq!("receiver dropped", src.to_string());
        assert!(SwarmError::other("bla").source().unwrap().source().is_none());
    }

    #[test]
    fn ensure_swarm_error_type_is_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(SwarmError::other("bla"));
    }
}
