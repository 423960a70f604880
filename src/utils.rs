pub mod errorfmt;
pub mod hash_map_ext;
pub mod ordered_float;
