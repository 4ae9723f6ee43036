//! HTTP API: job admission, lookup and cancellation.

pub mod app;
