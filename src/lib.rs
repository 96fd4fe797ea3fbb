#![crate_name = "rust_pox"]
#![crate_type = "lib"]
#![allow(clippy::unused_io_amount)]
extern crate byteorder;
extern crate bytes;
extern crate ipnetwork;

#[macro_use]
extern crate log;

extern crate failure;

#[macro_use]
extern crate failure_derive;

pub mod apps;

mod bits;

#[macro_use]
mod ofp_utils;

pub mod clock;
pub mod config;
pub mod datapath;
pub mod event;
pub mod flow_table;
pub mod match_spec;
pub mod message;
pub mod ofp_connection;
pub mod ofp_controller;
pub mod ofp_header;
pub mod ofp_message;
pub mod ofp_transport;
pub mod openflow;
pub mod openflow0x01;
pub mod packet;
pub mod packet_buffer;
pub mod sync_table;
