//! Poll a Daikin Altherma 4 heat pump over Modbus TCP.
//!
//! The [`coordinator::Coordinator`] owns a [`connection::Transport`], reads the registers
//! described by a [`registers::Catalog`] in as few requests as possible, and publishes every
//! completed cycle as an immutable [`snapshot::Snapshot`] along with edge timestamps and synthetic
//! values from [`derived`].

pub mod address_set;
pub mod commands;
pub mod connection;
pub mod coordinator;
pub mod derived;
pub mod modbus;
pub mod output;
pub mod poll;
pub mod power;
pub mod registers;
pub mod simulator;
pub mod snapshot;
