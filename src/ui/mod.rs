//! Discord rendering helpers.

pub mod controls;
pub mod embeds;
