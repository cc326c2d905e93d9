//! # Dispatch
//!
//! **An aggregation and acceleration tier between the investigation
//! browser tool and a family of wiki back ends.**
//!
//! Dispatch turns many small, expensive client queries into a smaller
//! number of batched, cached, and streamed upstream interactions against
//! two data sources: the public action API of each wiki, and the
//! read-only SQL replicas mirroring the internal schema. A live change
//! stream keeps cached revision data coherent with the authoritative
//! source.
//!
//! ## Architecture
//!
//! ```text
//!             ┌────────────┐   ┌───────────────┐
//!  client ───▶│ HTTP surface│──▶│ task engines  │── jobs ──┐
//!             └──────┬─────┘   └───────────────┘          │
//!                    │                 ┌──────────────────┤
//!                    ▼                 ▼                  ▼
//!             ┌────────────┐   ┌────────────┐    ┌──────────────┐
//!             │  expander  │──▶│ rev. store │    │ replica pool │
//!             │ (coalescer)│   │ (stream-   │    │ (min 0, idle │
//!             └──────┬─────┘   │  coherent) │    │  5s)         │
//!                    │         └─────▲──────┘    └──────────────┘
//!                    ▼               │
//!               action API     change stream
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-derived settings, startup-fatal validation |
//! | [`logging`] | Rotating file + stderr tracing setup |
//! | [`error`] | API error taxonomy and `errorformat` envelopes |
//! | [`models`] | Wikis, namespaces, revisions, deletion records |
//! | [`sites`] | Site registry: dbname/hostname/origin lookups |
//! | [`titles`] | Per-wiki namespace-aware title canonicalization |
//! | [`clients`] | One authenticated HTTP client per wiki |
//! | [`replica`] | Replica SQL pools under the no-idle policy |
//! | [`query`] | Typed join composer for the revision/archive/logging family |
//! | [`expander`] | Staggered revision coalescer (batches of ≤ 50) |
//! | [`events`] | SSE change-stream consumer |
//! | [`store`] | Stream-coherent revision cache |
//! | [`tasks`] | Async task engine: tickets, progress, sweep, dedup |
//! | [`logparams`] | Parser for deletion `log_params` payloads |
//! | [`deleted`] | Deleted-revision / deleted-page reconstruction |
//! | [`largest`] | Largest-edits ranking |
//! | [`talk`] | Talk-page filter scanning |
//! | [`server`] | The HTTP routes |

pub mod clients;
pub mod config;
pub mod deleted;
pub mod error;
pub mod events;
pub mod expander;
pub mod largest;
pub mod logging;
pub mod logparams;
pub mod models;
pub mod query;
pub mod replica;
pub mod server;
pub mod sites;
pub mod store;
pub mod talk;
pub mod tasks;
pub mod titles;
