// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! This crate provides a TCP gateway for GT06 family GPS tracker devices
//! # Examples
//! ```no_run
//! # use gt06::{config::Config, publish::LogPublisher, server::GatewayServer};
//! # use std::sync::Arc;
//!
//! # async fn run() -> Result<(), gt06::error::Error> {
//!     let config = Config::default();
//!     config.validate()?;
//!     let server = GatewayServer::new(config, Arc::new(LogPublisher));
//!     let listener = server.bind().await?;
//!     server.serve(listener).await?;
//! #   Ok(())
//! # }
//! ```
pub mod codec;
pub mod command;
pub mod config;
mod constant;
pub mod crc;
pub mod error;
pub mod handler;
pub mod message;
pub mod publish;
pub mod server;
pub mod session;
