//! End-to-end tests: a real engine on a temporary deployment root

mod deployment;
mod helpers;
mod lifecycle;
