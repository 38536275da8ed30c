pub mod actor;
pub mod audit;
pub mod entities;
pub mod record;

pub use actor::{Actor, SYSTEM_ACTOR, actor_name};
pub use audit::AuditMeta;
pub use entities::{
    Customer, Enquiry, Fee, Note, Product, ROLE_ADMIN, ROLE_BROKER, ROLE_VIEWER,
    StageHistoryEntry, User,
};
pub use record::{
    EntityFields, Record, apply_patch, fields_from_input, merge_patch, parse_fields,
    sanitize_input,
};
