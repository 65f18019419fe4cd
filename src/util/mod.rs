pub mod atomic_map;
pub mod buf;
pub mod safe_converter;
