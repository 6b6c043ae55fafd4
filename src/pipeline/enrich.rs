//! Concrete enrichment and screening adapters.

pub mod dnc;
pub mod litigator;
pub mod person;

pub use dnc::{DNC_SCREENING, DncAdapter};
pub use litigator::{LITIGATOR_SCREENING, LitigatorAdapter};
pub use person::{PERSON_LOOKUP, PersonLookupAdapter};
