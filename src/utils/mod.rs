// =============================================================================
// Matrixon Appservice - Utils Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Logging setup and the timing wrapper composed around public operations.
//
// =============================================================================

pub mod logging;
pub mod metrics;

pub use metrics::timed;
