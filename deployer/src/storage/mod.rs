//! Local state: layout, settings, presets and deployment records

pub mod identity;
pub mod layout;
pub mod presets;
pub mod settings;
