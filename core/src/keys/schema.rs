use super::path::{ChildNumber, DerivationPath};

/// The wallet's fixed derivation namespace.
///
/// Every key the wallet uses lives under the base path; each branch is a single
/// non-hardened segment below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema;

impl Schema {
    pub const BASE_PATH: &'static str = "m/schema:1'/recovery:1'";

    pub const CHANGE: (&'static str, u32) = ("change", 0);
    pub const EXTERNAL: (&'static str, u32) = ("external", 1);
    pub const CONTACTS: (&'static str, u32) = ("contacts", 2);
    pub const METADATA: (&'static str, u32) = ("metadata", 3);
    pub const INVOICES: (&'static str, u32) = ("invoices", 4);

    pub fn base_path() -> DerivationPath {
        Self::branch_root(&[])
    }

    pub fn change_path() -> DerivationPath {
        Self::branch(Self::CHANGE)
    }

    pub fn external_path() -> DerivationPath {
        Self::branch(Self::EXTERNAL)
    }

    pub fn contacts_path() -> DerivationPath {
        Self::branch(Self::CONTACTS)
    }

    /// Root of the one-time keys used to encrypt operation metadata to ourselves.
    pub fn metadata_path() -> DerivationPath {
        Self::branch(Self::METADATA)
    }

    /// Root of the keys behind incoming-swap invoices.
    pub fn invoices_path() -> DerivationPath {
        Self::branch(Self::INVOICES)
    }

    fn branch((comment, index): (&str, u32)) -> DerivationPath {
        Self::branch_root(&[ChildNumber::labeled(index, false, comment)])
    }

    fn branch_root(children: &[ChildNumber]) -> DerivationPath {
        DerivationPath::master()
            .child(ChildNumber::labeled(1, true, "schema"))
            .child(ChildNumber::labeled(1, true, "recovery"))
            .extend(children)
    }
}
