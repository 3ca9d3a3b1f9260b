//! Domain types - addresses, states, schedules and configuration
//!
//! These types carry no runtime behavior of their own and are shared by the
//! watch, deploy, component and scheduler layers.

pub mod address;
pub mod config;
pub mod schedule;
pub mod state;
