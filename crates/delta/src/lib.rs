// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

//! Invertible structural deltas over BSON documents.
//!
//! A [`DocumentDelta`] records, for every changed slot of a document, both the
//! value before and the value after the change. That makes a delta
//! self-contained: it can be applied forward, inverted and applied backward,
//! and composed with other deltas without ever consulting the documents it
//! was computed from.
//!
//! Deltas are produced by [`DocumentDelta::diff`], combined with
//! [`DocumentDelta::compose`] (associative, with [`DocumentDelta::identity`]
//! as the unit), and merged three ways with [`three_way_merge`]. The binary
//! encoding in [`codec`] is the persisted form.

mod codec;
mod delta;
mod error;
mod merge;
mod path;

pub use codec::{decode, encode};
pub use delta::DocumentDelta;
pub use error::Error;
pub use merge::{MergeOutcome, three_way_merge};
pub use path::{Path, Segment};

pub type Result<T> = std::result::Result<T, Error>;
