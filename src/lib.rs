// src/lib.rs
//
// World Bank WDI series summary ingestion: a transform step that cleans
// WDISeries.csv into object storage, then a load step that replaces the
// warehouse table with it.

pub mod assemble;
pub mod config;
pub mod error;
pub mod load;
pub mod pipeline;
pub mod schedule;
pub mod schema;
pub mod storage;
pub mod transform;
