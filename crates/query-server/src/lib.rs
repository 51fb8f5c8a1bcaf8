//! Statement result protocol for Query Engine
//!
//! Clients fetch the output of a running query page by page over HTTP. Each
//! page is addressed by a token; asking for the same token again returns
//! the same page, so a client can retry a lost response without losing or
//! duplicating rows. When the query recovers from a task failure, the
//! result session follows the query to its new attempt and skips the rows
//! it already handed out.
//!
//! # Architecture
//!
//! - **QueryManager**: what the protocol knows about a query (state, slug, session)
//! - **QueryRegistry**: result sessions by query id, purged once the query is forgotten
//! - **Query**: one result session, turning exchange output into token-addressed pages
//! - **HTTP**: the `/v1/statement/executing` resource
//!
//! # Example
//!
//! ```ignore
//! use query_server::{LocalQueryManager, QueryRegistry, ServerConfig, Session};
//! use query_distributed::DefaultExchangeClientSupplier;
//! use std::sync::Arc;
//!
//! let manager = Arc::new(LocalQueryManager::new(executor, retention));
//! let (query_id, slug) = manager.submit(plan, Session::new("alice"))?;
//! let registry = QueryRegistry::new(
//!     manager,
//!     Arc::new(DefaultExchangeClientSupplier::default()),
//!     ServerConfig::default(),
//! );
//! query_server::serve(listener, registry, shutdown).await?;
//! ```

pub mod config;
pub mod http;
pub mod local;
pub mod manager;
pub mod query;
pub mod registry;
pub mod results;
pub mod session;

#[cfg(test)]
mod testing;

pub use config::ServerConfig;
pub use http::{add_session_headers, parse_data_size, parse_duration, serve, statement_router};
pub use local::LocalQueryManager;
pub use manager::{FailureInfo, QueryInfo, QueryManager, Session};
pub use query::Query;
pub use registry::QueryRegistry;
pub use results::{Column, QueryErrorInfo, QueryResults, ResultsPage, StatementStats};
pub use session::{SessionDelta, SessionUpdate};
