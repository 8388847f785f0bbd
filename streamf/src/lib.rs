// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Forwards connections between listeners and dialers over tcp, unix sockets,
//! in-process pipes, WebSocket and TLS, and exposes services behind NAT
//! through portals that remote bridge agents keep connections parked with.

pub mod common;
pub mod pool;
pub mod util;

pub mod bridge;
pub mod network;
pub mod portal;

pub mod agent;
pub mod dialer;
pub mod listener;

pub mod app;
pub mod config;

pub use app::{AppError, AppInfo, Application};
pub use config::{Config, ConfigError};
