//! The switchyard daemon: the delivery scheduler plus the socket that wakes
//! it up.

pub mod controller;
pub mod listener;
