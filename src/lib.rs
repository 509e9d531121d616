// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Nebula Reconcile
//!
//! A declarative reconciliation engine for `OpenNebula` resources.
//!
//! ## Overview
//!
//! Nebula keeps security groups, virtual networks, images and virtual
//! machines on an `OpenNebula` endpoint in line with a YAML file:
//!
//! - Create what is missing, update what drifted, delete what is no longer declared
//! - Wait for objects to reach a usable state before moving on
//! - Resume interrupted multi-step updates without repeating finished steps
//! - Resolve users and groups by name or ID
//!
//! ## Architecture
//!
//! 1. **Desired state**: defined in `nebula.yaml`
//! 2. **Applied state**: recorded per resource under `.nebula/`
//! 3. **Observed state**: read through the XML-RPC API
//! 4. **Reconciler**: diffs the three and drives the per-kind drivers
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, validation and hashing
//! - [`one`]: XML-RPC codec and client
//! - [`template`]: Template documents and their parser
//! - [`permissions`]: Octal permission strings
//! - [`resolver`]: Name to ID resolution
//! - [`poller`]: Waiting for lifecycle states
//! - [`drivers`]: Per-kind create, read, update and delete
//! - [`planner`]: Diffing and resumable update sequencing
//! - [`state`]: Applied state storage and locking
//! - [`reconciler`]: The reconciliation loop
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! provider:
//!   endpoint: http://one.example.com:2633/RPC2
//!
//! security_groups:
//!   - name: web
//!     rules:
//!       - protocol: TCP
//!         rule_type: INBOUND
//!         range: "80,443"
//!
//! vms:
//!   - name: web-1
//!     cpu: 1
//!     memory: 1024
//!     permissions: "640"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod drivers;
pub mod error;
pub mod one;
pub mod permissions;
pub mod planner;
pub mod poller;
pub mod reconciler;
pub mod resolver;
pub mod state;
pub mod template;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig, ResourceConfig};
pub use drivers::{DriverContext, Drivers, ResourceKind, ResourceSummary};
pub use error::{NebulaError, Result};
pub use one::{OneClient, RemoteSession};
pub use permissions::Permissions;
pub use planner::{DiffEngine, DiffResult, UpdateSequencer};
pub use poller::{PollConfig, StatePoller};
pub use reconciler::{ReconciliationResult, Reconciler};
pub use state::{LocalStateStore, ReconcileState, StateStore};
