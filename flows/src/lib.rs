//! Batch data flows of the municipal data office.
//!
//! Each flow is a plain async function over injected clients; [`runner`]
//! wires the real ones from a [`config::FlowsConfig`].

pub mod config;
pub mod error;
pub mod flooding;
pub mod flow;
pub mod gcp;
pub mod healthcheck;
pub mod iam;
pub mod lgpd;
pub mod mapa_realizacoes;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod secrets;
pub mod sink;
pub mod state;
pub mod telemetry;

pub use config::FlowsConfig;
pub use error::FlowError;
pub use error::FlowResult;
pub use flow::FlowContext;
pub use flow::FlowReport;
pub use iam::BatchPolicyFetcher;
pub use registry::FlowKind;
pub use registry::FlowRegistry;
pub use retry::BackoffPolicy;
pub use runner::FlowRunner;
pub use runner::RunOptions;
