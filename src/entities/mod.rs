// Entity Models
//
// Code entries and mappings reference each other by value (system + code),
// never by owning pointer. Hierarchy is a parent back-reference; children
// are derived on read.

pub mod audit;
pub mod code_entry;
pub mod code_system;
pub mod mapping;
pub mod user;

pub use audit::AuditLog;
pub use code_entry::{CodeEntry, Designation, DesignationUse, PropertyValue, MAX_CODE_LEN};
pub use code_system::{
    CodeSystem, EntryStatus, Icd11Module, ICD11_URI, NAMASTE_URI, WHO_AYURVEDA_URI,
};
pub use mapping::{ConceptMapping, Equivalence, MappingMethod};
pub use user::{Role, User};
