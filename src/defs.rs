//! Definition loading, inheritance resolution, and typed views.
//!
//! A *definition* is a named YAML document describing a build, a run, or a
//! suite. Definitions extend one another through an `extends` key; the
//! store resolves the ancestry chain and merges descendant onto ancestor
//! with the rules in [`merge`].

pub mod merge;
pub mod store;
pub mod value;

pub use store::{DefKind, DefStore, GroupDef, RunDef, SuiteDef, SuiteSettings};
pub use value::DefValue;
