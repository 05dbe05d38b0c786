//! SQLHub Federation - queries across heterogeneous connections
//!
//! Queries reference tables on named connections as
//! `@connection[.schema].table`. A single-connection query is pushed down
//! to its backend unchanged (modulo identifier rewriting); anything else
//! is federated: referenced tables are fetched in parallel and the query
//! is evaluated over the materialized rows in the coordinator.

mod executor;
mod merge;
mod parser;
mod plan;
mod planner;

pub use executor::{MultiQueryExecutor, MultiQueryOptions, MultiQueryOutcome};
pub use merge::{MergedResult, VirtualTable};
pub use parser::{MultiQueryParse, MultiQueryRef, parse_multi_query};
pub use plan::{FetchStep, Plan, ResolvedStrategy, Strategy, ValidationReport};
pub use planner::Planner;
