// =============================================================================
// Matrixon Appservice - Service Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Business logic of the appservice layer. Each service keeps its storage
//   needs behind a `Data` trait implemented in `database::key_value`.
//
// Architecture:
//   • sync: snapshot classification and the long-poll loop
//   • intent: per-user registration, joins, sends and encryption setup
//   • rooms: room state access and upgrade chain resolution
//   • appservice: namespaces, intent map and pushed transactions
//   • dispatcher: lifecycle handler registry
//   • autojoin: invite and upgrade following handlers
//
// =============================================================================

pub mod appservice;
pub mod autojoin;
pub mod dispatcher;
pub mod intent;
pub mod rooms;
pub mod sync;
