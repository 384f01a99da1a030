//! Kernel structures for rtnetlink address messages.

pub mod addr;
