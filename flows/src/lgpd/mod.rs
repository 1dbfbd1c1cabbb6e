//! Data-protection (LGPD) dumps: who can read which table, when access was
//! granted, and what each table contains.

pub mod auditlog;
pub mod metadata;
pub mod tables_bindings;
