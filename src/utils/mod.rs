//! Process hygiene helpers

pub mod fd_closure;
