#![doc = "classroom-sync-core: roster loading and reconciliation logic for classroom-sync."]

//! This crate holds everything that does not touch HTTP or the terminal: the roster
//! tables, the remote contract, classification of remote responses, the bounded
//! fan-out executor, the reconciliation engine and the CSV report writer.
//!
//! # Usage
//! The `classroom-sync` binary supplies a [`contract::ClassroomApi`] implementation
//! and drives a [`reconcile::Reconciler`] per command.

pub mod classify;
pub mod config;
pub mod contract;
pub mod error;
pub mod fanout;
pub mod models;
pub mod reconcile;
pub mod report;
pub mod roster;
pub mod session;
