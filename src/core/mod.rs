pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{Result, StoreError};
pub use types::{Document, ENVELOPE_FIELDS, EntityKind, ID_FIELD, IdFormat, VERSION_FIELD};
