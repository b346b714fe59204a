// ===============================
// src/lib.rs
// ===============================
//
// Pipeline per tick:
//   feed -> strategy -> arbitration -> risk -> positions (ledger) -> store
// `engine` menjahit semuanya dan mengekspos API untuk layer API/CLI.
//
pub mod domain;
pub mod config;
pub mod metrics;
pub mod recorder;
pub mod feed;
pub mod strategy;
pub mod arbitration;
pub mod risk;
pub mod positions;
pub mod store;
pub mod notify;
pub mod engine;
