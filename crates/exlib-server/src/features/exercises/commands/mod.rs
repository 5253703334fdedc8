pub mod set_annotations;

pub use set_annotations::{SetAnnotationsCommand, SetAnnotationsError};
