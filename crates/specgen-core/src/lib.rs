pub mod catalog;
pub mod error;
pub mod naming;
pub mod render;
pub mod selector;
pub mod spec;
