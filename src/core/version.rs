use std::cmp::Ordering;

pub use semver::Version;

/// Version of the runtime that export descriptors are matched against.
pub fn runtime_version() -> Version {
    Version::new(0, 1, 0)
}

/// Checks whether an exported version satisfies a required one.
///
/// `got` satisfies `required` when both share the same major version, the
/// minor version also matches for the unstable `0.x` range, and `got` is at
/// least `required`. Build metadata never participates in the comparison.
pub fn is_compatible(got: &Version, required: &Version) -> bool {
    if got.major != required.major {
        return false;
    }
    if required.major == 0 && got.minor != required.minor {
        return false;
    }
    got.cmp_precedence(required) != Ordering::Less
}
