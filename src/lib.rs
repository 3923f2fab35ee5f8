// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Idempotent workstation provisioning.
//!
//! Converge takes an ordered list of __desired state items__ (packages that
//! must be installed, files that must hold exact content, and settings that
//! must read back a given value) and drives the host toward that state one
//! item at a time. Running it twice in a row changes nothing the second time.
//!
//! # Flow
//!
//! The [platform probe](platform) detects the host and its package manager.
//! The [reconciliation loop](reconcile) then, for every item, asks the
//! [state inspector](inspect) whether the item is already satisfied. If it is
//! not, the loop [backs up](backup) whatever file is about to be overwritten,
//! runs the item's [mutating action](action) through the
//! [retryable executor](executor), and inspects the item again to confirm it
//! converged. Every outcome lands in a [run report](report) that is always
//! persisted, even when the run is cut short.

pub mod action;
pub mod backup;
pub mod config;
pub mod context;
pub mod exec;
pub mod executor;
pub mod inspect;
pub mod item;
pub mod package;
pub mod path;
pub mod platform;
pub mod reconcile;
pub mod report;
pub mod setting;
