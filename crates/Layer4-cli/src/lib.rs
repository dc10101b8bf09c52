//! fnjob CLI library: the functions the `fnjob` binary serves

pub mod demo;
