use std::{
    fmt::{Debug, Display, Formatter},
    hash::{Hash, Hasher},
};

/// A double that compares and hashes by its bit pattern so that it can be
/// used as a dictionary key.
#[derive(Copy, Clone)]
#[repr(transparent)]
pub struct F64(pub f64);

impl Eq for F64 {}

impl PartialEq for F64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Hash for F64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl From<f64> for F64 {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl Display for F64 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for F64 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}
