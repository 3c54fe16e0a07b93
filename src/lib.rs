//! tlsproxy - a host-based reverse proxy with a process supervisor
//!
//! This library provides a daemon that:
//! - Terminates HTTP and HTTPS for many virtual hosts on shared ports
//! - Routes each request by Host header to a redirect, proxy, static file or websocket action
//! - Obtains certificates per domain via ACME (HTTP-01) or serves static/self-signed ones
//! - Supervises the processes declared next to each site, restarting them with backoff
//! - Exposes a line-delimited JSON control protocol on a Unix socket

pub mod acme;
pub mod action;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod identity;
pub mod listener;
pub mod process;
pub mod proxy;
pub mod serve;
pub mod sites;
pub mod tls;
pub mod websocket;
