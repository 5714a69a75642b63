//! Ingestion: claim-then-deliver pipeline and the per-user worker
//! that supervises IDLE sessions and the token-refresh loop.

pub mod delivery;
pub mod worker;

pub use worker::{
    ingest_account, ingest_via_imap, spawn_worker, UserContext, WorkerConfig, WorkerControl,
    WorkerHandle,
};
