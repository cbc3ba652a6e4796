//! Name matching for OCR-extracted agency, clinician and patient names.

pub mod resolver;
pub mod similarity;
pub(crate) mod util;

pub use resolver::{resolve, resolve_or_create, Registry, Resolvable, Resolution, Resolved, FUZZY_THRESHOLD};
pub use similarity::similarity;
