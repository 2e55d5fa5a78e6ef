//! Supervision and orphan reclamation for agent fleets hosted in tmux.

pub mod config;
pub mod doctor;
pub mod events;
pub mod lock;
pub mod names;
pub mod proc;
pub mod reap;
pub mod session;
pub mod tmux;
pub mod workspace;
