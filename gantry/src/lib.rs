//! Container-aware TCP flow agent: a `tcp_connect` kprobe feeds flow events
//! into userspace, each event is attributed to the owning container (or the
//! `host` sentinel) and appended to a WAL SQLite ledger that the summary
//! view polls concurrently.

pub mod config;
pub mod monitor;
pub mod storage;
pub mod utils;
