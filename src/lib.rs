//! llx - a local shell command assistant.
//!
//! A short-lived `llx` client hands a natural-language request to a resident
//! `llxd` daemon over a Unix socket. The daemon keeps a language model loaded,
//! turns the request into a single shell command and streams it back token by
//! token.

pub mod client;
pub mod config;
pub mod daemon;
pub mod protocol;
