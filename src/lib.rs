//! Keeps a remote-desktop broker's connections in line with credential directives written in
//! virtual machine notes.
//!
//! # Directives
//!
//! A directive is a run of `key:value` tokens ended by a semicolon, anywhere in a machine's
//! notes:
//!
//! ```text
//! user:"admin" pass:"hunter2" protos:"rdp,ssh" confName:"{vmname}-{proto}";
//! ```
//!
//! Each directive yields one broker connection per listed protocol. When an encryption key is
//! configured, plaintext secrets are replaced in the notes with encrypted ones the first time they
//! are seen.
//!
//! # Program flow
//!
//! Below is a high-level overview of a sync pass. Details live in the relevant modules.
//!
//! 1. [sync::Session::run] lists the machines and reads their notes through a
//!    [platform::Virtualization] implementation. [core::directive] parses them and [crypto]
//!    encrypts any plaintext secrets.
//!
//! 2. [network::resolver] finds each machine's IPv4 address, strongest evidence first.
//!
//! 3. [core::spec] turns each directive into desired connections, and [core::plan] diffs those
//!    against what the [platform::Broker] holds. Nothing has changed anywhere yet; the plan can be
//!    inspected, and questions it raises are answered through [core::clarify].
//!
//! 4. [run_plan::Executor] applies the plan, reporting each action as it goes.

pub mod config;
pub mod core;
pub mod crypto;
pub mod logging;
pub mod network;
pub mod platform;
pub mod run_plan;
pub mod sync;

#[doc(inline)]
pub use config::Config;

#[doc(inline)]
pub use sync::{Session, SyncReport};
