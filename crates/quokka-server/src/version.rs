/// MongoDB server version reported to drivers; the wire behavior the
/// gateway implements corresponds to this release line.
pub const MONGODB_VERSION: &str = "5.0.42";

/// Components of [`MONGODB_VERSION`] for `buildInfo.versionArray`.
pub const MONGODB_VERSION_ARRAY: [i32; 4] = [5, 0, 42, 0];

/// The gateway's own version.
pub fn gateway_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
