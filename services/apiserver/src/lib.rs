// Resource API server with request-scope resolution.
//
// Requests may carry a scope selector (query parameter, path prefix, or
// field selector entry). The filter pipeline extracts the selector, resolves
// it into the currently-published namespace mapping, and the read path
// translates the mapping into a namespace selector plus a per-store resource
// version floor. Scoped watches are supervised by watch gates that terminate
// the stream when the mapping expires or the fleet minimum overtakes the
// watch's starting point.
pub mod app;
pub mod config;
pub mod error;
pub mod filters;
pub mod handlers;
pub mod observability;
pub mod remote;
pub mod resources;
pub mod scoped_rv;
pub mod selectors;
