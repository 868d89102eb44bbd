//! kiln: control plane of an AI-driven 3D-asset pipeline.
//!
//! A client submits a text prompt; four candidate images come back; the
//! client picks one; a 3D model is generated from it and optionally handed
//! to a slicer. This crate is the job orchestration and event fan-out
//! engine behind that flow: the API surface, identity, and the external
//! providers themselves live elsewhere and plug in through the traits in
//! [`providers`], [`storage`], and [`bus`].

pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod providers;
pub mod queue;
pub mod registry;
pub mod service;
pub mod storage;
pub mod store;
pub mod sweeper;
pub mod unpack;
pub mod workers;

pub use error::KilnError;
