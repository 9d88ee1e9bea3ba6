//! Binds the review convergence loop to the workflow's phase transitions.

pub mod review_integration;

pub use review_integration::ReviewDriver;
