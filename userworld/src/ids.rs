//! Small identifiers shared across modules that otherwise have no common
//! dependency: a pipe's two ends each carry the owning cartel's id (spec
//! §5: "pipes carry `readCartel` and `writeCartel` pointers so
//! cross-cartel lifetime is well-defined"), and the unix namespace keys
//! waiting connectors by the same id.

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct CartelId(pub u64);
