//! A glossary of terms used in the blockswarm project.
//!
//! ## Sendable request
//! A unit of work the scheduler operates on. A higher-level download or
//! upload decomposes into one or more sendable requests, each listing the
//! items (single low-level key operations) it still wants processed.
//!
//! ## Durable request
//! A request whose state must survive a restart. Every mutation of its
//! state runs on the checkpointing job runner.
//!
//! ## Ephemeral request
//! A request that is abandoned on restart. Its mutations run on the
//! immediate job runner.
//!
//! ## Chosen block
//! A single selected low-level fetch or insert, ready for dispatch to the
//! network. It stays in flight until exactly one completion callback is
//! called or it is dropped.
//!
//! ## Cooldown
//! A temporary exclusion of an item from selection after a failure. The
//! interval grows with each failure of the same item, up to a maximum.
//!
//! ## Offered key
//! A key a peer proactively offers to send. Offered keys bypass the
//! priority tables, but are only fetched while some get listens for them.
//!
//! ## Traffic class
//! Real-time or bulk. The two classes have separate schedulers so
//! interactive and background transfers never starve each other.
//!
//! ## Tripping a key
//! Handing an arrived block to every get listening for its key. The block
//! layer trips a key when a block arrives from the network or the store.
