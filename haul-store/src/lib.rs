//! Durable state store for the haul upload agent.
//!
//! Backed by `sled`, an embedded LSM-tree key/value engine, mirroring the
//! teacher lineage's preference for a single embedded-DB file colocated with
//! the process rather than a standalone database service. Two trees back the
//! two tables of the data model: `jobs` (one row per [`UploadJob`]) and
//! `parts` (one row per [`PartRow`], keyed by `(upload_id, part_number)`).

#![deny(unsafe_code)]

mod keys;
mod store;

pub use store::StateStore;
