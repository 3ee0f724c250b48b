//! Low-level outcome codes reported by the network layer, and their
//! translation into the fetch/insert error taxonomy seen by requests.
//!
//! Every low-level code maps to exactly one [FailureClass]:
//!
//! - [FailureClass::Transient]: the network is busy or the route is bad
//!   right now. The item is cooled down and offered again. No retry is
//!   consumed and nothing is reported upward.
//! - [FailureClass::Retryable]: the attempt itself failed. The item is
//!   cooled down and one retry is consumed. Once the request's retry
//!   budget is exhausted the failure is reported upward.
//! - [FailureClass::Fatal]: retrying cannot help. Reported upward at once.

/// How the scheduler reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Cool down and re-queue, never reported.
    Transient,
    /// Cool down, consume a retry, report when the budget is exhausted.
    Retryable,
    /// Report immediately.
    Fatal,
}

/// A low-level fetch failure, as reported by the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum LowLevelGetError {
    /// The block arrived but could not be decoded.
    #[error("decode failed")]
    DecodeFailed,
    /// No node on the route had the block.
    #[error("data not found")]
    DataNotFound,
    /// Local-only fetch and the block is not in the store.
    #[error("data not found in store")]
    DataNotFoundInStore,
    /// Something broke inside the node.
    #[error("internal error")]
    InternalError,
    /// A downstream node rejected the request because it is overloaded.
    #[error("rejected overload")]
    RejectedOverload,
    /// The request could not be routed far enough.
    #[error("route not found")]
    RouteNotFound,
    /// The request could not be routed at all.
    #[error("route really not found")]
    RouteReallyNotFound,
    /// The block arrived but did not verify against its key.
    #[error("verify failed")]
    VerifyFailed,
    /// The request was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// The transfer started but did not complete.
    #[error("transfer failed")]
    TransferFailed,
    /// The key failed recently and the network refuses to retry it yet.
    #[error("recently failed")]
    RecentlyFailed,
    /// A code this version does not know.
    #[error("unknown low-level get error code {0}")]
    Unknown(u32),
}

impl LowLevelGetError {
    /// Map a wire-level error code to a typed error.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::DecodeFailed,
            2 => Self::DataNotFound,
            3 => Self::InternalError,
            4 => Self::RejectedOverload,
            5 => Self::RouteNotFound,
            6 => Self::RouteReallyNotFound,
            7 => Self::VerifyFailed,
            8 => Self::Cancelled,
            9 => Self::TransferFailed,
            10 => Self::RecentlyFailed,
            11 => Self::DataNotFoundInStore,
            other => Self::Unknown(other),
        }
    }
}

/// A low-level insert failure, as reported by the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum LowLevelPutError {
    /// Something broke inside the node.
    #[error("internal error")]
    InternalError,
    /// The insert could not be routed far enough.
    #[error("route not found")]
    RouteNotFound,
    /// A downstream node rejected the insert because it is overloaded.
    #[error("rejected overload")]
    RejectedOverload,
    /// The insert could not be routed at all.
    #[error("route really not found")]
    RouteReallyNotFound,
    /// A different block already exists under this signed-subspace key.
    #[error("collision")]
    Collision,
    /// The insert was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// A code this version does not know.
    #[error("unknown low-level put error code {0}")]
    Unknown(u32),
}

impl LowLevelPutError {
    /// Map a wire-level error code to a typed error.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::InternalError,
            2 => Self::RouteNotFound,
            3 => Self::RejectedOverload,
            4 => Self::RouteReallyNotFound,
            5 => Self::Collision,
            6 => Self::Cancelled,
            other => Self::Unknown(other),
        }
    }
}

/// Fetch failure modes visible to the client-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorMode {
    /// The data was not found.
    DataNotFound,
    /// The data was found but could not be decoded or verified.
    BlockDecodeError,
    /// The network is overloaded.
    RejectedOverload,
    /// No route to the data.
    RouteNotFound,
    /// The transfer did not complete.
    TransferFailed,
    /// The key failed recently.
    RecentlyFailed,
    /// The request was cancelled.
    Cancelled,
    /// A bug in the node.
    InternalError,
}

impl FetchErrorMode {
    /// How the scheduler reacts to this mode.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::RejectedOverload
            | Self::RouteNotFound
            | Self::RecentlyFailed => FailureClass::Transient,
            Self::DataNotFound | Self::TransferFailed => {
                FailureClass::Retryable
            }
            Self::BlockDecodeError | Self::Cancelled | Self::InternalError => {
                FailureClass::Fatal
            }
        }
    }
}

/// A typed fetch failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fetch failed: {mode:?}: {message}")]
pub struct FetchError {
    /// The failure mode.
    pub mode: FetchErrorMode,
    /// Human-readable detail.
    pub message: String,
}

impl FetchError {
    /// Construct a fetch error.
    pub fn new(mode: FetchErrorMode, message: impl Into<String>) -> Self {
        Self {
            mode,
            message: message.into(),
        }
    }

    /// A cancellation outcome.
    pub fn cancelled() -> Self {
        Self::new(FetchErrorMode::Cancelled, "request cancelled")
    }

    /// Translate a low-level fetch failure.
    ///
    /// Unknown codes are logged and reported as internal errors, never
    /// dropped.
    pub fn translate(err: LowLevelGetError) -> Self {
        use FetchErrorMode::*;
        use LowLevelGetError as L;
        let mode = match err {
            L::DecodeFailed | L::VerifyFailed => BlockDecodeError,
            L::DataNotFound | L::DataNotFoundInStore => DataNotFound,
            L::RecentlyFailed => RecentlyFailed,
            L::InternalError => InternalError,
            L::RejectedOverload => RejectedOverload,
            L::RouteNotFound | L::RouteReallyNotFound => RouteNotFound,
            L::TransferFailed => TransferFailed,
            L::Cancelled => Cancelled,
            L::Unknown(code) => {
                tracing::error!(
                    "unknown low-level get error code {code}, reporting as internal error"
                );
                InternalError
            }
        };
        Self::new(mode, err.to_string())
    }
}

/// Insert failure modes visible to the client-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertErrorMode {
    /// No route for the insert.
    RouteNotFound,
    /// The network is overloaded.
    RejectedOverload,
    /// A different block already exists under this key.
    Collision,
    /// The insert was cancelled.
    Cancelled,
    /// A bug in the node.
    InternalError,
}

impl InsertErrorMode {
    /// How the scheduler reacts to this mode.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::RejectedOverload | Self::RouteNotFound => FailureClass::Transient,
            Self::Collision | Self::Cancelled | Self::InternalError => {
                FailureClass::Fatal
            }
        }
    }
}

/// A typed insert failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("insert failed: {mode:?}: {message}")]
pub struct InsertError {
    /// The failure mode.
    pub mode: InsertErrorMode,
    /// Human-readable detail.
    pub message: String,
}

impl InsertError {
    /// Construct an insert error.
    pub fn new(mode: InsertErrorMode, message: impl Into<String>) -> Self {
        Self {
            mode,
            message: message.into(),
        }
    }

    /// A cancellation outcome.
    pub fn cancelled() -> Self {
        Self::new(InsertErrorMode::Cancelled, "request cancelled")
    }

    /// Translate a low-level insert failure.
    pub fn translate(err: LowLevelPutError) -> Self {
        use InsertErrorMode::*;
        use LowLevelPutError as L;
        let mode = match err {
            L::InternalError => InternalError,
            L::RouteNotFound | L::RouteReallyNotFound => RouteNotFound,
            L::RejectedOverload => RejectedOverload,
            L::Collision => Collision,
            L::Cancelled => Cancelled,
            L::Unknown(code) => {
                tracing::error!(
                    "unknown low-level put error code {code}, reporting as internal error"
                );
                InternalError
            }
        };
        Self::new(mode, err.to_string())
    }
}

/// A fetch or insert failure, as handled by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// A fetch failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// An insert failure.
    #[error(transparent)]
    Insert(#[from] InsertError),
}

impl RequestError {
    /// How the scheduler reacts to this failure.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Fetch(e) => e.mode.class(),
            Self::Insert(e) => e.mode.class(),
        }
    }

    /// Returns true if this is a cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Fetch(e) => e.mode == FetchErrorMode::Cancelled,
            Self::Insert(e) => e.mode == InsertErrorMode::Cancelled,
        }
    }
}
