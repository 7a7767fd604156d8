//! BLE profile tasks for a message-based vendor BLE stack.
//!
//! The link layer, L2CAP, ATT/GATT and GAP live in a closed vendor stack. What this crate
//! provides sits on top of it: one task per profile role (battery, heart rate, cycling speed and
//! cadence, glucose, HID, time, scan parameters and OTA servers; alert notification, phone alert
//! status and cycling speed and cadence clients) plus the dispatcher routing messages between the
//! tasks and the application.
//!
//! # Structure
//!
//! The vendor stack is reached through two traits: [`AttributeDb`] for the attribute database,
//! and [`Kernel`] for message passing, task states and the GAP connection table. A platform
//! implements both once and names them in a [`Config`]. The [`sim`] module provides in-memory
//! implementations for running on a host.
//!
//! A profile is a [`Profile`] implementation: a transition function taking the current state and
//! one inbound message, returning the next state and the messages to send. [`Task`] runs a profile
//! against the kernel, and [`Dispatcher`] delivers queued messages to the tasks one at a time.
//!
//! [`AttributeDb`]: att/trait.AttributeDb.html
//! [`Kernel`]: kernel/trait.Kernel.html
//! [`Config`]: config/trait.Config.html
//! [`sim`]: sim/index.html
//! [`Profile`]: task/trait.Profile.html
//! [`Task`]: task/struct.Task.html
//! [`Dispatcher`]: dispatch/struct.Dispatcher.html

// We're `#[no_std]`, except when we're testing
#![cfg_attr(not(test), no_std)]
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(rust_2018_idioms)]
#![allow(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod att;
pub mod bytes;
pub mod config;
pub mod dispatch;
mod error;
pub mod gatt;
pub mod kernel;
pub mod prf;
pub mod sim;
pub mod task;
pub mod uuid;

pub use self::error::Error;
pub use self::utils::HexSlice;
