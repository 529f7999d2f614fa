//! Assist backend library.
//!
//! Streams assistant replies from a hosted model to chat clients, keeps the
//! conversation history, and periodically exports it as PDF transcripts
//! bundled into an uploaded archive.

pub mod api;
pub mod assistant;
pub mod chat;
pub mod config;
pub mod db;
pub mod export;
pub mod ingest;
pub mod llm;
pub mod report;
pub mod store;
