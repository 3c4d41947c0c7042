#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buf;
pub mod cluster;
pub mod codec;
pub mod dispatch;
pub mod forward;
pub mod fragment;
pub mod msg;
pub mod net;
pub mod stats;
pub mod topo;
