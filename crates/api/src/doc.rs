//! Documentation module for the blockswarm project.
//!
//! This module contains high-level documentation to explain the project
//! and define terms used across the other documentation.

pub mod glossary;
