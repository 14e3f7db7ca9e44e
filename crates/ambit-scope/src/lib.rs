// Request-scope resolution core.
//
// This crate maintains the in-memory mapping from scope selectors to
// namespace sets on a single API server, keeps it reconciled against the
// externally stored scope definitions, and provides the per-watch gates that
// force clients to re-list when the mapping they observed has been
// superseded anywhere in the fleet.
//
// The seams to the outside world are deliberately narrow: a
// `DefinitionClient` for reading/updating scope definitions (and watching
// for changes), and a `ResourceStoreMapper` describing the physical storage
// topology. Everything else is owned here.
pub mod mapping;
pub mod queue;
pub mod resolver;
pub mod source;
pub mod stores;
pub mod testing;
pub mod watch;

pub use mapping::{ExpireReason, ExpirySignal, ScopeMapping};
pub use queue::KeyedQueue;
pub use resolver::{DefaultScopeResolver, ResolveError, ScopeResolver};
pub use source::{DefinitionClient, SourceError};
pub use stores::{
    FixedStoreBackend, ResourceStoreMapper, SimpleStoreMapper, StoreBackend, StoreError,
};
pub use watch::{GateError, MinimumVersionChecker, ScopeWatchGate};
