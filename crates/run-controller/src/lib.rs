/*
 * Run Controller - Batch Run Lifecycle Engine for Kubernetes
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Run lifecycle engine
//!
//! Turns run requests into Kubernetes objects (a main job, an optional worker
//! group, buffer plumbing) and reconciles them until their logs are archived,
//! their final status is recorded and the objects are gone.

pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod metadata;
pub mod model;
pub mod runs;
pub mod store;
pub mod sweeper;

pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use runs::{RunCreator, RunManager};
pub use sweeper::{RunSweeper, SweeperHandle};
