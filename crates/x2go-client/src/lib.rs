//! x2go-client: the connection-owning side of the x2go client engine.
//!
//! This crate provides:
//! - `TransportChannel`: one authenticated SSH connection with serialized
//!   exec/SFTP access and reverse-forward routing
//! - `ControlSession`: the text command protocol, discovery caches and
//!   the session listing retry policy
//! - `ReverseTunnel`: managed reverse port-forwards (graphics, sound,
//!   sshfs)
//! - `TerminalSession`: per-session resource lifecycle and server command
//!   construction
//! - `Session`: the stable-identity facade and its state machine
//! - `SessionRegistry`: fleet-wide reconciliation and master-session
//!   election
//! - Collaborator contracts (hooks, profile store, SSH proxy, queues)

pub mod config;
pub mod control;
pub mod hooks;
pub mod registry;
pub mod session;
pub mod terminal;
pub mod transport;
pub mod tunnel;

pub use config::{ConnectOptions, Credentials, ProfileStore, ProxyOptions, SshProxy};
pub use control::{ControlSession, ListingRetryPolicy};
pub use hooks::{DefaultHooks, SessionHooks};
pub use registry::{PromotionWaits, RegisterRequest, SessionRegistry, UpdateTarget};
pub use session::{Session, SessionBuilder, SessionFeatures};
pub use terminal::{FolderKind, TerminalOptions, TerminalSession, TerminalState};
pub use transport::{CommandTransport, TransportChannel};
pub use tunnel::{ReverseTunnel, TunnelKind, TunnelState};

pub use x2go_core::{Error, Result};
